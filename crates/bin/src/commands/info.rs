//! Info command - shows the peer identity served by a running node.

use std::time::Duration;

use lansync::PeerInfo;

use crate::cli::{Format, InfoArgs};
use crate::output::print_table;

/// Run the info command
pub async fn run(args: &InfoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/info", args.url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()?;

    let response = client.get(&url).send().await?.error_for_status()?;
    let info: PeerInfo = response.json().await?;

    match args.format {
        Format::Human => print_table(
            &["FIELD", "VALUE"],
            &[
                vec!["Peer ID".into(), info.peer_id.to_string()],
                vec!["Name".into(), info.display_name.clone()],
                vec!["Address".into(), info.endpoint()],
                vec!["WebSocket".into(), info.ws_url()],
            ],
        ),
        Format::Json => println!("{}", serde_json::to_string(&info)?),
    }
    Ok(())
}
