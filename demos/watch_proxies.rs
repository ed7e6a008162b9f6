use std::error::Error;
use std::sync::Arc;

use proxypanel_sdk::panel_api::PanelApiClient;
use proxypanel_sdk::retry::ReconnectPolicy;
use proxypanel_sdk::session::PanelSession;
use proxypanel_sdk::stream::{ConnectionState, Payload};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

const DEFAULT_PANEL_URL: &str = "http://localhost:8080";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_url = std::env::var("PANEL_URL").unwrap_or_else(|_| DEFAULT_PANEL_URL.to_string());
    let password = SecretString::new(std::env::var("PANEL_PASSWORD")?);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = Arc::new(PanelSession::new(&base_url)?);
        session.try_login(&password).await?;

        let api = PanelApiClient::new(Arc::clone(&session));
        for proxy in api.fetch_proxies().await? {
            println!("{} {} -> {} [{}]", proxy.name, proxy.listen_addr, proxy.target_addr, proxy.status);
        }

        let client = session.stream_client(ReconnectPolicy::default())?;
        let mut payloads = client.watch_payload();
        let mut states = client.watch_state();
        client.subscribe(api.proxies_stream()?)?;

        loop {
            tokio::select! {
                changed = payloads.changed() => {
                    changed?;
                    match &*payloads.borrow_and_update() {
                        Some(Payload::Json(value)) => println!("proxies: {value}"),
                        Some(Payload::Text(text)) => println!("raw: {text}"),
                        None => {}
                    }
                }
                changed = states.changed() => {
                    changed?;
                    let state = *states.borrow_and_update();
                    println!("stream {state:?}");
                    if state == ConnectionState::Closed {
                        if let Some(err) = client.last_error() {
                            println!("stream ended: {err}");
                        }
                        break;
                    }
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
