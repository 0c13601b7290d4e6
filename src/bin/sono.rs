use sono::api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = api::build_app(rocket::Config::figment())?;
    app.launch().await?;
    Ok(())
}
