use std::process::exit;

#[tokio::main]
async fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    exit(caldo::cli::run(args).await);
}
