use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use param_z::codec::format_value;
use param_z::vmem::client::format_regions;
use param_z::{
    Builder, Context, ContextBuilder, Error, ParamHandle, ParamMask, QueueDirection, Result, SetMode, Value,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "paramz", about = "Get, set and back up parameters of remote nodes")]
struct Args {
    /// Address of this process
    #[arg(short, long, default_value_t = 100)]
    address: u16,
    /// Target node, 0 for this process
    #[arg(short, long, global = true)]
    node: Option<u16>,
    /// Round-trip timeout in milliseconds
    #[arg(short, long, global = true, default_value_t = 1000)]
    timeout: u64,
    /// Protocol version
    #[arg(long, global = true, default_value_t = 2)]
    version: u8,
    #[arg(short, long, default_value = "peer")]
    mode: String,
    #[arg(short, long)]
    endpoint: Option<String>,
    /// Zenoh configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read a parameter
    Get {
        name: String,
        #[arg(short, long, allow_negative_numbers = true)]
        offset: Option<i32>,
        /// Send to this address instead of the parameter's node
        #[arg(long)]
        host: Option<u16>,
    },
    /// Write a parameter. Arrays take `[a, b, ...]`
    Set {
        name: String,
        value: String,
        #[arg(short, long, allow_negative_numbers = true)]
        offset: Option<i32>,
        #[arg(long)]
        host: Option<u16>,
    },
    /// Pull every parameter of a node selected by masks
    Pull {
        #[arg(short, long, default_value = "*")]
        include: String,
        #[arg(short, long, default_value = "Rh")]
        exclude: String,
    },
    /// Apply several `name=value` pairs in one exchange
    Push {
        assignments: Vec<String>,
        /// Only a node with this hardware id applies the values
        #[arg(long, value_parser = parse_hex)]
        hwid: Option<u32>,
    },
    /// Show known parameters
    List {
        pattern: Option<String>,
        #[arg(short, long, default_value = "*")]
        mask: String,
    },
    /// Fetch the parameter list of a node
    Download {
        #[arg(long)]
        remotes: bool,
    },
    /// Drop cached parameters of a node, or of every node
    Forget {
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the parameter table as `list add` lines
    Save {
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        include_node: bool,
    },
    /// List storage regions
    Vmem,
    /// Copy a region into a file
    Backup {
        region: u16,
        file: PathBuf,
    },
    /// Copy a file into a region
    Restore {
        region: u16,
        file: PathBuf,
    },
    /// Unlock protected regions of a node
    Unlock,
    /// Serve parameters and regions until interrupted
    Serve {
        /// `list add` lines describing extra parameters
        #[arg(short, long)]
        list: Option<PathBuf>,
        /// File-backed regions as `id:name:path:size`
        #[arg(short, long)]
        region: Vec<String>,
        #[arg(long, value_parser = parse_hex)]
        hwid: Option<u32>,
    },
}

fn parse_hex(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, if digits.len() < s.len() { 16 } else { 10 }).map_err(|e| e.to_string())
}

/// Text as typed by the user. Numbers are parsed against the parameter type.
fn parse_value(text: &str) -> Value {
    match text.trim().strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        Some(items) => Value::Array(
            items
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(|s| Value::Str(s.to_owned()))
                .collect(),
        ),
        None => Value::Str(text.to_owned()),
    }
}

/// Find a parameter, downloading the node's list once if it is not known yet.
fn resolve(ctx: &Context, name: &str, node: Option<u16>) -> Result<ParamHandle> {
    match ctx.find(name, node) {
        Err(Error::NotFound { node, .. }) if node != param_z::LOCAL_NODE => {
            info!("{name} unknown, downloading the list of node {node}");
            ctx.download(Some(node), None, None, false)?;
            ctx.find(name, Some(node))
        }
        other => other,
    }
}

fn print(ctx: &Context, param: &ParamHandle) {
    match ctx.get(param, None, false, None) {
        Ok(value) => println!("{param} = {}", format_value(param.ty(), &value)),
        Err(e) => println!("{param} ({e})"),
    }
}

fn parse_region(spec: &str) -> Result<(u16, String, PathBuf, u32)> {
    let bad = || Error::Config(format!("region '{spec}' is not id:name:path:size"));
    let parts: Vec<&str> = spec.splitn(4, ':').collect();
    let [id, name, path, size] = parts.as_slice() else {
        return Err(bad());
    };
    Ok((
        id.parse().map_err(|_| bad())?,
        name.to_string(),
        PathBuf::from(path),
        size.parse().map_err(|_| bad())?,
    ))
}

fn run(ctx: &Context, args: Args) -> Result<()> {
    let node = args.node;
    match args.command {
        Command::Get { name, offset, host } => {
            let param = resolve(ctx, &name, node)?;
            let value = ctx.get(&param, offset, true, host)?;
            println!("{param} = {}", format_value(param.ty(), &value));
        }
        Command::Set {
            name,
            value,
            offset,
            host,
        } => {
            let param = resolve(ctx, &name, node)?;
            ctx.set(&param, &parse_value(&value), offset, host, SetMode::Immediate)?;
            print(ctx, &param);
        }
        Command::Pull { include, exclude } => {
            let include: ParamMask = include.parse()?;
            let target = node.unwrap_or(ctx.default_node());
            if ctx.list(ParamMask::all(), Some(target), None)?.is_empty() {
                ctx.download(Some(target), None, None, false)?;
            }
            let n = ctx.pull_all(Some(target), Some(include), Some(exclude.parse()?), None, None)?;
            info!("pulled {n} values");
            for param in ctx.list(include, Some(target), None)? {
                print(ctx, &param);
            }
        }
        Command::Push { assignments, hwid } => {
            ctx.cmd_new(QueueDirection::Set, "cli");
            for assignment in &assignments {
                let Some((name, value)) = assignment.split_once('=') else {
                    return Err(Error::Config(format!("expected name=value, got '{assignment}'")));
                };
                let param = resolve(ctx, name.trim(), node)?;
                ctx.set(&param, &parse_value(value), None, None, SetMode::Queued)?;
            }
            print!("{}", ctx.queue());
            let n = ctx.push(node, None, hwid)?;
            println!("applied {n} values");
        }
        Command::List { pattern, mask } => {
            for param in ctx.list(mask.parse()?, node, pattern.as_deref())? {
                print(ctx, &param);
            }
        }
        Command::Download { remotes } => {
            let added = ctx.download(node, None, None, remotes)?;
            println!("{added} new parameters");
            for param in ctx.list(ParamMask::all(), Some(node.unwrap_or(ctx.default_node())), None)? {
                println!("{param}");
            }
        }
        Command::Forget { verbose } => {
            println!("forgot {} parameters", ctx.forget(node, verbose)?);
        }
        Command::Save { file, include_node } => match file {
            Some(path) => {
                let n = ctx.list_save(&mut File::create(&path)?, node, include_node)?;
                println!("saved {n} parameters to {}", path.display());
            }
            None => {
                ctx.list_save(&mut io::stdout().lock(), node, include_node)?;
            }
        },
        Command::Vmem => {
            print!("{}", format_regions(&ctx.vmem(node, None)?));
        }
        Command::Backup { region, file } => {
            let data = ctx.backup(node.unwrap_or(ctx.default_node()), region, None)?;
            std::fs::write(&file, &data)?;
            println!("wrote {} bytes to {}", data.len(), file.display());
        }
        Command::Restore { region, file } => {
            let data = std::fs::read(&file)?;
            ctx.restore(node.unwrap_or(ctx.default_node()), region, None, &data)?;
            println!("restored {} bytes", data.len());
        }
        Command::Unlock => {
            ctx.unlock(node.unwrap_or(ctx.default_node()), None)?;
            println!("unlocked");
        }
        Command::Serve { .. } => {
            info!("serving as node {}", ctx.address());
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    zenoh::init_log_from_env_or("warn");
    let args = Args::parse();

    let mut builder = ContextBuilder::default()
        .with_node(args.address)
        .with_default_node(args.node.unwrap_or(0))
        .with_timeout(Duration::from_millis(args.timeout))
        .with_version(args.version)
        .with_mode(args.mode.as_str());
    if let Some(endpoint) = &args.endpoint {
        builder = builder.with_connect_endpoints([endpoint.as_str()]);
    }
    if let Some(config) = &args.config {
        builder = builder.with_zenoh_config_file(config);
    }
    let mut list_file = None;
    if let Command::Serve { list, region, hwid } = &args.command {
        for spec in region {
            let (id, name, path, size) = parse_region(spec)?;
            builder = builder.with_file_region(id, &name, path, size);
        }
        if let Some(hwid) = hwid {
            builder = builder.with_hwid(*hwid);
        }
        list_file = list.clone();
    } else {
        builder = builder.with_servers(false);
    }

    let ctx = builder.build()?;
    ctx.init()?;
    if let Some(path) = list_file {
        let n = ctx.list_load(BufReader::new(File::open(&path)?))?;
        info!("loaded {n} parameters from {}", path.display());
    }
    let result = run(&ctx, args);
    ctx.shutdown()?;
    result
}
