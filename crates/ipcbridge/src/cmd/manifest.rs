use serde::Serialize;

use ipcbridge::wire::Manifest;

use crate::cmd::ManifestArgs;
use crate::exit::{io_error, wire_error, CliResult, SUCCESS};
use crate::output::{print_json, print_table, OutputFormat};

#[derive(Serialize)]
struct MethodInfo<'a> {
    name: &'a str,
    call_type: &'static str,
    stream: bool,
}

#[derive(Serialize)]
struct ManifestOutput<'a> {
    path: String,
    valid: bool,
    methods: Vec<MethodInfo<'a>>,
}

pub fn run(args: ManifestArgs, format: OutputFormat) -> CliResult<i32> {
    let context = format!("manifest {}", args.file.display());
    let text = std::fs::read_to_string(&args.file).map_err(|e| io_error(&context, e))?;
    let manifest = Manifest::from_json(&text).map_err(|e| wire_error(&context, e))?;
    tracing::debug!(path = %args.file.display(), methods = manifest.len(), "manifest valid");

    let out = ManifestOutput {
        path: args.file.display().to_string(),
        valid: true,
        methods: manifest
            .iter()
            .map(|(name, call_type)| MethodInfo {
                name,
                call_type: call_type.as_str(),
                stream: call_type.is_stream(),
            })
            .collect(),
    };

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_table(
            &["METHOD", "CALL TYPE", "STREAM"],
            out.methods.iter().map(|m| {
                vec![
                    m.name.to_string(),
                    m.call_type.to_string(),
                    if m.stream { "yes" } else { "no" }.to_string(),
                ]
            }),
        ),
        OutputFormat::Pretty => {
            println!("{} ({} methods)", out.path, out.methods.len());
            for m in &out.methods {
                println!("  {:<24} {}", m.name, m.call_type);
            }
        }
    }
    Ok(SUCCESS)
}
