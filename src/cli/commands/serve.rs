//! Web server command.

use console::style;

use super::check::ensure_valid;
use crate::cli::icons::arrow;
use crate::config::Settings;

/// Start the web server.
pub async fn cmd_serve(settings: &Settings, bind: Option<&str>) -> anyhow::Result<()> {
    ensure_valid(settings)?;

    let (host, port) = match bind {
        Some(bind) => parse_bind_address(bind, &settings.server.host, settings.server.port),
        None => (settings.server.host.clone(), settings.server.port),
    };

    println!(
        "{} Starting analyst server at http://{}:{} ({} / {})",
        arrow(),
        host,
        port,
        settings.llm.provider,
        settings.llm.model()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    crate::server::serve(settings, &host, port).await
}

/// Parse a bind address that can be:
/// - Just a port: "3030" -> default_host:3030
/// - Just a host: "127.0.0.1" -> 127.0.0.1:default_port
/// - Host and port: "0.0.0.0:3030" -> 0.0.0.0:3030
fn parse_bind_address(bind: &str, default_host: &str, default_port: u16) -> (String, u16) {
    if let Ok(port) = bind.parse::<u16>() {
        return (default_host.to_string(), port);
    }

    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (host.to_string(), port);
        }
    }

    (bind.to_string(), default_port)
}
