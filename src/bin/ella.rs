#[tokio::main]
async fn main() {
    std::process::exit(ella::cli::run().await);
}
