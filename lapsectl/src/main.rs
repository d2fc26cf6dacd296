use clap::Parser;

fn main() {
    let cli = lapsectl::Cli::parse();
    if let Err(err) = lapsectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
