//! Connect to a receiver, show its state and optionally play a URL.
//!
//! ```text
//! cargo run --example control -- 192.168.1.50 [http://host/video.mp4 video/mp4]
//! ```

use googlecast::{
    Device, DeviceRecord, ErrorReceiver, StateReceiver, StateUpdate, DEFAULT_PORT,
};
use std::time::Duration;

/// Default Media Receiver
const DEFAULT_APP: &str = "CC1AD845";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(ip) = args.next() else {
        eprintln!("usage: control <ip> [url [mime-type]]");
        std::process::exit(2);
    };
    let url = args.next();
    let mime = args.next().unwrap_or_else(|| "video/mp4".to_string());

    let record = DeviceRecord {
        id: ip.clone(),
        addresses: vec![ip.parse()?],
        port: DEFAULT_PORT,
        ..Default::default()
    };
    let device = Device::new(record)?;

    let (states, mut state_rx) = StateReceiver::channel();
    let (errors, mut error_rx) = ErrorReceiver::channel();
    device
        .connect_with_timeout(Duration::from_secs(5), errors, states)
        .await?;
    device.update_status().await?;

    let mut launched = false;
    let mut loaded = false;
    loop {
        tokio::select! {
            update = state_rx.recv() => {
                let update = update?;
                println!("{:?}", update);
                println!("{}", device);

                if let StateUpdate::Connection { state, .. } = update {
                    if state == googlecast::ConnectionState::Disconnected {
                        break;
                    }
                }

                let Some(url) = url.as_deref() else { continue };
                if loaded {
                    continue;
                }
                match device.app() {
                    Some(app) if app.app_id == DEFAULT_APP => {
                        device.load_media(url, &mime, true).await?;
                        loaded = true;
                    }
                    _ if !launched && device.volume().is_some() => {
                        device.launch_app(DEFAULT_APP).await?;
                        launched = true;
                    }
                    _ => {}
                }
            }
            error = error_rx.recv() => {
                let error = error?;
                eprintln!("{}: {}", error.id, error.error);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    device.disconnect().await?;
    Ok(())
}
