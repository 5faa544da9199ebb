use std::fs;
use std::io::{self, Read};

use anyhow::{Context, Result, bail};
use luacloak::{Options, obfuscate, options::Profile};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut profile: Option<String> = None;
    let mut seed: u64 = 0;
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut print_metadata = false;
    let mut input_path: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--profile" | "-p" => {
                profile = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("Missing profile name after {arg}"))?,
                );
            }
            "--seed" | "-s" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Missing seed after {arg}"))?;
                seed = value
                    .parse()
                    .with_context(|| format!("Parsing seed '{value}'"))?;
            }
            "--option" | "-o" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Missing key=value after {arg}"))?;
                let (key, value) = value
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("Expected key=value, got '{value}'"))?;
                pairs.push((key.to_string(), value.to_string()));
            }
            "--metadata" | "-m" => {
                print_metadata = true;
            }
            _ => {
                input_path = Some(arg);
                if args.next().is_some() {
                    bail!("Only one input file is supported");
                }
                break;
            }
        }
    }

    let source = if let Some(path) = input_path {
        fs::read(&path).with_context(|| format!("Reading {path}"))?
    } else {
        let mut buffer = Vec::new();
        io::stdin()
            .read_to_end(&mut buffer)
            .context("Reading stdin")?;
        buffer
    };

    let mut options = Options::from_pairs(pairs)?;
    if let Some(name) = profile {
        options.profile = Some(
            Profile::from_name(&name)
                .ok_or_else(|| anyhow::anyhow!("Unknown profile '{name}'"))?,
        );
    }

    let result = obfuscate(&source, &options, seed)?;
    print!("{}", result.code);
    if print_metadata {
        let metadata = serde_json::json!({
            "originalSize": result.original_size,
            "obfuscatedSize": result.obfuscated_size,
            "expansionRatio": result.expansion_ratio,
            "securityLevel": result.security_level,
            "checksum": result.checksum,
        });
        eprintln!("{}", serde_json::to_string_pretty(&metadata)?);
    }
    Ok(())
}
