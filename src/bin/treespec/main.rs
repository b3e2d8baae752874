use std::fs::File;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{span, Level};

mod args;
use args::{split_keywords_arg, CommandLineArgs, ResultFormat};
use treespec::keywords::{DEFAULT_KEYWORDS, DEFAULT_TAR_KEYWORDS, DEFAULT_UPDATE_KEYWORDS};
use treespec::{check, parse_manifest, tar, tar_check, update, walk, CheckResult, Keyword};

fn init_logger(verbosity: u8) {
    let sub = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_file(false)
        .with_line_number(false);
    // DEBUG=1 in the environment forces full trace output.
    let debug_env = std::env::var("DEBUG").map(|v| v == "1").unwrap_or(false);
    let (level, pretty) = match verbosity {
        _ if debug_env => (Level::TRACE, true),
        0 => (Level::WARN, false),
        1 => (Level::INFO, false),
        2 => (Level::DEBUG, true),
        _ => (Level::TRACE, true),
    };
    let sub = sub.with_max_level(level);
    if pretty {
        sub.pretty().init();
    } else {
        sub.init();
    }
}

fn main() -> Result<ExitCode> {
    let args = CommandLineArgs::parse();
    init_logger(args.verbose);
    let span = span!(Level::DEBUG, "main", root = args.path.as_str());
    let _guard = span.enter();

    // --list-keywords
    if args.list_keywords {
        println!("Available keywords:");
        for keyword in Keyword::known() {
            print!(" {keyword}");
            if keyword.is_default() {
                print!(" (default)");
            }
            if !keyword.is_bsd() {
                print!(" (not upstream)");
            }
            println!();
        }
        return Ok(ExitCode::SUCCESS);
    }

    let keywords = gather_keywords(&args)?;

    // -f <file>: load the manifest unless we are creating a new one.
    let manifest = match &args.file {
        Some(file) if !args.create => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("read manifest {file}"))?;
            Some(parse_manifest(&text).map_err(anyhow::Error::new)?)
        }
        _ => None,
    };

    // --list-used
    if args.list_used {
        let Some(manifest) = &manifest else {
            bail!("no manifest provided; --list-used needs -f");
        };
        let used = manifest.used_keywords();
        if args.result_format == ResultFormat::Json {
            let file = args.file.as_ref().expect("manifest implies -f").to_string();
            let names: Vec<String> = used.iter().map(Keyword::name).collect();
            let data = std::collections::BTreeMap::from([(file, names)]);
            println!("{}", serde_json::to_string_pretty(&data)?);
        } else {
            println!("Keywords used in [{}]:", args.file.as_ref().expect("manifest implies -f"));
            for keyword in used {
                print!(" {keyword}");
                if !keyword.is_comparable() {
                    print!(" (unsupported)");
                }
                println!();
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    // -u is meaningless against an archive.
    if args.update_attributes && args.tar.is_some() {
        bail!("-u cannot be used with -T");
    }

    // -T <tar|->: build a hierarchy from the archive byte stream.
    let tar_manifest = match &args.tar {
        Some(source) => {
            let reader: Box<dyn Read> = if source == "-" {
                Box::new(io::stdin().lock())
            } else {
                Box::new(File::open(source).with_context(|| format!("open archive {source}"))?)
            };
            Some(tar::stream(reader, &keywords).context("stream tar archive")?)
        }
        None => None,
    };

    if args.create {
        // -c: emit a manifest for the archive or the root directory.
        let created = match tar_manifest {
            Some(dh) => dh,
            None => walk::walk(args.path.as_std_path(), &keywords)?,
        };
        let stdout = io::stdout();
        created.write_to(&mut stdout.lock())?;
        return Ok(ExitCode::SUCCESS);
    }

    if args.update_attributes {
        let Some(manifest) = &manifest else {
            bail!("no manifest provided; -u needs -f");
        };
        let result = update(args.path.as_std_path(), manifest, &DEFAULT_UPDATE_KEYWORDS, None)?;
        report(&result, args.result_format)?;
        return Ok(exit_code(&result));
    }

    let result = match (&tar_manifest, &manifest) {
        (Some(tar_dh), Some(dh)) => tar_check(tar_dh, dh, Some(&keywords)),
        (None, Some(dh)) => check(args.path.as_std_path(), dh, Some(&keywords), None)?,
        _ => bail!("neither validating nor creating a manifest; see --help"),
    };
    report(&result, args.result_format)?;
    Ok(exit_code(&result))
}

/// Assembles the working keyword set from -k, -K and --bsd-keywords.
fn gather_keywords(args: &CommandLineArgs) -> Result<Vec<Keyword>> {
    let mut keywords = match &args.use_keywords {
        Some(arg) => {
            let mut keywords = split_keywords_arg(arg)?;
            // A manifest without type is near useless; keep it first.
            if !keywords.contains(&Keyword::Type) {
                keywords.insert(0, Keyword::Type);
            }
            keywords
        }
        None if args.tar.is_some() => DEFAULT_TAR_KEYWORDS.to_vec(),
        None => DEFAULT_KEYWORDS.to_vec(),
    };
    if let Some(arg) = &args.add_keywords {
        for keyword in split_keywords_arg(arg)? {
            if !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
    }
    if args.bsd_keywords {
        keywords.retain(|keyword| {
            if keyword.is_bsd() {
                true
            } else {
                eprintln!("INFO: ignoring {keyword} as it is not an upstream keyword");
                false
            }
        });
    }
    Ok(keywords)
}

fn report(result: &CheckResult, format: ResultFormat) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match format {
        // The full result as JSON.
        ResultFormat::Json => {
            serde_json::to_writer(&mut out, result)?;
            writeln!(out)?;
        }
        // One line per failure, BSD style, then structural drift.
        ResultFormat::Bsd => {
            for failure in &result.failures {
                writeln!(out, "{failure}")?;
            }
            for extra in &result.extra {
                writeln!(out, "{extra} extra")?;
            }
            for missing in &result.missing {
                writeln!(out, "{missing} missing")?;
            }
        }
        // Only the paths that did not validate.
        ResultFormat::Path => {
            for failure in &result.failures {
                writeln!(out, "{}", failure.path)?;
            }
            for extra in &result.extra {
                writeln!(out, "{extra}")?;
            }
            for missing in &result.missing {
                writeln!(out, "{missing}")?;
            }
        }
    }
    Ok(())
}

fn exit_code(result: &CheckResult) -> ExitCode {
    if result.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
