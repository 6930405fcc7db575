#[tokio::main]
async fn main() {
    match pontoon::app::run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    }
}
