use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use ipcbridge::export::{export_api, Duplex, Methods, Readable, Reply, StreamReturn, Writable};
use ipcbridge::import::{import_api_with_config, CallError, ImportConfig, Importer};
use ipcbridge::transport::LocalBus;
use ipcbridge::wire::{CallType, Manifest, Value};

use crate::cmd::{parse_duration, DemoArgs};
use crate::exit::{
    export_error, import_error, transport_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS,
};
use crate::output::{print_json, print_table, OutputFormat};

const CHANNEL: &str = "demo";

#[derive(Serialize)]
struct Outcome {
    method: &'static str,
    call_type: &'static str,
    ok: bool,
    result: String,
}

impl Outcome {
    fn new(method: &'static str, call_type: CallType, result: Result<Value, CallError>) -> Self {
        let (ok, result) = match result {
            Ok(value) => (true, value.to_string()),
            Err(err) => (false, err.to_string()),
        };
        Self {
            method,
            call_type: call_type.as_str(),
            ok,
            result,
        }
    }
}

pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| CliError::new(INTERNAL, format!("failed to start runtime: {e}")))?;

    let outcomes = runtime.block_on(exercise(timeout))?;
    print_outcomes(&outcomes, format);

    if outcomes.iter().all(|o| o.ok) {
        Ok(SUCCESS)
    } else {
        Ok(FAILURE)
    }
}

fn manifest() -> Manifest {
    Manifest::new()
        .with("add", CallType::Sync)
        .with("greet", CallType::Async)
        .with("reverse", CallType::Promise)
        .with("count", CallType::Readable)
        .with("collect", CallType::Writable)
        .with("shout", CallType::Duplex)
}

fn methods(collected: Arc<Mutex<Vec<Value>>>) -> Methods {
    Methods::new()
        .sync("add", |_, args| {
            Ok(Value::Int(args.iter().filter_map(Value::as_i64).sum()))
        })
        .callback("greet", |_, args, reply: Reply| {
            let name = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                reply.ok(format!("hello, {name}"));
            });
        })
        .promise("reverse", |_, args| async move {
            let mut bytes = args
                .first()
                .and_then(Value::as_bytes)
                .map(|b| b.to_vec())
                .unwrap_or_default();
            bytes.reverse();
            Ok(Value::from(bytes))
        })
        .readable("count", |_, args| {
            let upto = args.first().and_then(Value::as_i64).unwrap_or(3);
            let stream = Readable::new();
            for n in 1..=upto {
                stream.push(n);
            }
            stream.end();
            Ok(StreamReturn::from(stream))
        })
        .writable("collect", move |_, _| {
            let sink = Arc::clone(&collected);
            let stream = Writable::new(move |chunk| {
                sink.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(chunk);
                Ok(())
            });
            Ok(StreamReturn::from(stream))
        })
        .duplex("shout", |_, _| {
            let echo: Arc<Mutex<Option<Readable>>> = Arc::new(Mutex::new(None));
            let target = Arc::clone(&echo);
            let duplex = Duplex::new(move |chunk| {
                let loud = Value::from(chunk.as_str().unwrap_or_default().to_uppercase());
                if let Some(readable) = target
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .as_ref()
                {
                    readable.push(loud);
                }
                Ok(())
            });
            let readable = duplex.readable().clone();
            *echo.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(readable.clone());
            Ok(StreamReturn::from(duplex.on_finish(move || readable.end())))
        })
}

async fn within<T, F>(timeout: Duration, call: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(CallError::Timeout(timeout)))
}

async fn exercise(timeout: Duration) -> CliResult<Vec<Outcome>> {
    let bus = LocalBus::new().map_err(|e| transport_error("loopback bus", e))?;
    let collected = Arc::new(Mutex::new(Vec::new()));
    export_api(&bus, CHANNEL, manifest(), methods(Arc::clone(&collected)))
        .map_err(|e| export_error("export", e))?;

    let view = Arc::new(bus.connect());
    let api: Importer = import_api_with_config(
        view.clone(),
        CHANNEL,
        manifest(),
        ImportConfig::default().with_timeout(timeout),
    )
    .map_err(|e| import_error("import", e))?;
    tracing::debug!(endpoint = view.id(), "demo endpoint connected");

    let mut outcomes = Vec::new();

    outcomes.push(Outcome::new(
        "add",
        CallType::Sync,
        api.call_sync("add", vec![Value::Int(2), Value::Int(3)]),
    ));

    let (tx, rx) = oneshot::channel();
    api.call_async("greet", vec![Value::from("ipcbridge")], move |result| {
        let _ = tx.send(result);
    });
    let greeting = rx.await.unwrap_or(Err(CallError::Canceled));
    outcomes.push(Outcome::new("greet", CallType::Async, greeting));

    let reversed = api.call("reverse", vec![Value::from(b"bridge".to_vec())]).await;
    outcomes.push(Outcome::new("reverse", CallType::Promise, reversed));

    let counted = within(timeout, async {
        let stream = api.open_stream("count", vec![Value::Int(4)])?;
        stream.read_to_end().await.map(Value::List)
    })
    .await;
    outcomes.push(Outcome::new("count", CallType::Readable, counted));

    let written = within(timeout, async {
        let stream = api.open_stream("collect", vec![])?;
        for word in ["one", "two", "three"] {
            stream.write(word)?;
        }
        stream.end()?;
        stream.read_to_end().await?;
        let seen = collected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Ok::<_, CallError>(Value::List(seen))
    })
    .await;
    outcomes.push(Outcome::new("collect", CallType::Writable, written));

    let shouted = within(timeout, async {
        let stream = api.open_stream("shout", vec![])?;
        stream.write("ping")?;
        stream.write("pong")?;
        stream.end()?;
        stream.read_to_end().await.map(Value::List)
    })
    .await;
    outcomes.push(Outcome::new("shout", CallType::Duplex, shouted));

    view.destroy();
    Ok(outcomes)
}

fn print_outcomes(outcomes: &[Outcome], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for outcome in outcomes {
                print_json(outcome);
            }
        }
        OutputFormat::Table => print_table(
            &["METHOD", "CALL TYPE", "OK", "RESULT"],
            outcomes.iter().map(|o| {
                vec![
                    o.method.to_string(),
                    o.call_type.to_string(),
                    o.ok.to_string(),
                    o.result.clone(),
                ]
            }),
        ),
        OutputFormat::Pretty => {
            for o in outcomes {
                let mark = if o.ok { "ok" } else { "FAILED" };
                println!("{:<8} {:<9} {:<6} {}", o.method, o.call_type, mark, o.result);
            }
        }
    }
}
