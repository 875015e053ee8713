use vigil::cli;

#[tokio::main]
async fn main() {
    let options = cli::parse_from_args();

    match vigil::run(options).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("vigil: {e:#}");
            std::process::exit(1);
        }
    }
}
