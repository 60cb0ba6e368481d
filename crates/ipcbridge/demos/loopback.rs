//! Serve a small API and call it from a second endpoint on the same bus.
//!
//! Run with: `cargo run -p ipcbridge --example loopback`

use std::sync::Arc;
use std::time::Duration;

use ipcbridge::export::{export_api, Methods, Readable, StreamReturn};
use ipcbridge::import::{import_api_with_config, ImportConfig};
use ipcbridge::transport::LocalBus;
use ipcbridge::wire::{CallType, Manifest, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest = Manifest::new()
        .with("square", CallType::Promise)
        .with("countdown", CallType::Readable);

    let bus = LocalBus::new()?;
    export_api(
        &bus,
        "example",
        manifest.clone(),
        Methods::new()
            .promise("square", |_, args| async move {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(n * n))
            })
            .readable("countdown", |_, args| {
                let from = args.first().and_then(Value::as_i64).unwrap_or(3);
                let stream = Readable::new();
                for n in (1..=from).rev() {
                    stream.push(n);
                }
                stream.end();
                Ok(StreamReturn::from(stream))
            }),
    )?;

    let view = Arc::new(bus.connect());
    let api = import_api_with_config(
        view,
        "example",
        manifest,
        ImportConfig::default().with_timeout(Duration::from_secs(1)),
    )?;

    let squared = api.call("square", vec![Value::Int(12)]).await?;
    println!("square(12) = {squared}");

    let chunks = api
        .open_stream("countdown", vec![Value::Int(5)])?
        .read_to_end()
        .await?;
    println!("countdown(5) = {}", Value::List(chunks));
    Ok(())
}
