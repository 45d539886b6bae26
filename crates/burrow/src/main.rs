use std::error::Error;
use std::path::PathBuf;
use std::process;

use burrow_core::backend::{find_processes, list_processes};
use burrow_core::container::RemoteVector;
use burrow_core::hexdump::{find_pattern, format_hexdump, parse_hex_bytes};
use burrow_core::overlay::{ClassNameResolver, ClassNameScheme, TypedMemory};
use burrow_core::types::Address;
use burrow_core::{BurrowError, Context, Process, StringLayout, TargetSelector, VersionTable};
use burrow_utils::{debug, info, init_logging_with_level, LogFormat, LogLevel, ToolkitConfig};
use clap::{Parser, Subcommand, ValueEnum};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Inspect and patch the memory of a running game.
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Inspect and patch the memory of a running game", long_about = None)]
struct Cli
{
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Version table to identify the target with (overrides BURROW_OFFSETS)
    #[arg(long, global = true)]
    offsets: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List running processes, optionally only those named NAME
    Ps
    {
        /// Process name to filter by
        name: Option<String>,
    },
    /// Show what burrow knows about a target
    Info
    {
        /// PID or process name (default: BURROW_TARGET)
        target: Option<String>,
    },
    /// List memory regions of a target
    Regions
    {
        /// PID or process name (default: BURROW_TARGET)
        target: Option<String>,
    },
    /// List threads of a target
    Threads
    {
        /// PID or process name (default: BURROW_TARGET)
        target: Option<String>,
    },
    /// Hexdump memory
    Peek
    {
        /// PID or process name
        target: String,
        /// Address (hex with 0x, or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Number of bytes to dump
        #[arg(short = 'n', long, default_value_t = 64)]
        length: usize,
    },
    /// Read one typed value
    Read
    {
        /// PID or process name
        target: String,
        /// Address (hex with 0x, or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Value type
        #[arg(short, long, value_enum, default_value_t = Width::U32)]
        width: Width,
    },
    /// Write one typed value while the target is suspended
    Write
    {
        /// PID or process name
        target: String,
        /// Address (hex with 0x, or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// New value (hex with 0x, decimal, or a float for f32/f64)
        #[arg(allow_hyphen_values = true)]
        value: String,
        /// Value type
        #[arg(short, long, value_enum, default_value_t = Width::U32)]
        width: Width,
    },
    /// Decode a string
    #[command(name = "string")]
    Text
    {
        /// PID or process name
        target: String,
        /// Address of the string object (or the characters with --c-string)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Read a NUL-terminated C string instead of the runtime's string type
        #[arg(long)]
        c_string: bool,
    },
    /// Show a remote vector
    Vector
    {
        /// PID or process name
        target: String,
        /// Address of the three-pointer header
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Size of one element in bytes
        #[arg(short, long)]
        element_size: usize,
        /// Print at most this many elements
        #[arg(long, default_value_t = 16)]
        limit: usize,
    },
    /// Class name of the object at an address
    Class
    {
        /// PID or process name
        target: String,
        /// Address of the object
        #[arg(value_parser = parse_address)]
        address: Address,
    },
    /// Search a range for a byte pattern
    Find
    {
        /// PID or process name
        target: String,
        /// Start of the range
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Length of the range in bytes
        length: usize,
        /// Bytes to look for ("de ad be ef")
        pattern: String,
    },
}

/// Value types for `read` and `write`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Width
{
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Ptr,
}

fn main()
{
    let cli = Cli::parse();

    let _logging = match init_logging_with_level(Some(LogLevel::from_verbosity(cli.verbose)), cli.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> CliResult<()>
{
    let config = ToolkitConfig::from_env()?;
    let offsets = cli.offsets.clone().or_else(|| config.offsets.clone());
    let context = build_context(offsets)?;

    match cli.command {
        Commands::Ps { name } => {
            let mut processes = match &name {
                Some(name) => find_processes(name)?,
                None => list_processes()?,
            };
            processes.sort_by_key(|info| info.pid.0);
            for process in processes {
                let exe = process
                    .executable
                    .as_deref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                println!("{:>8}  {:<20} {exe}", process.pid.0, process.name);
            }
            Ok(())
        }
        Commands::Info { target } => {
            let process = attach(&context, target, &config)?;
            print_info(&process)
        }
        Commands::Regions { target } => {
            let process = attach(&context, target, &config)?;
            for region in process.memory_map()?.iter() {
                println!("{region}");
            }
            Ok(())
        }
        Commands::Threads { target } => {
            let process = attach(&context, target, &config)?;
            for thread in process.threads()? {
                println!("{}", thread.raw());
            }
            Ok(())
        }
        Commands::Peek { target, address, length } => {
            let process = attach(&context, Some(target), &config)?;
            let bytes = process.read_bytes(address, length)?;
            print!("{}", format_hexdump(address, &bytes, 16));
            Ok(())
        }
        Commands::Read { target, address, width } => {
            let process = attach(&context, Some(target), &config)?;
            println!("{}", read_value(&process, address, width)?);
            Ok(())
        }
        Commands::Write {
            target,
            address,
            value,
            width,
        } => {
            let process = attach(&context, Some(target), &config)?;
            let scope = process.suspend_scope()?;
            let before = read_value(&process, address, width)?;
            write_value(&process, address, width, &value)?;
            let after = read_value(&process, address, width)?;
            scope.release()?;
            info!(%address, %before, %after, "value written");
            println!("{before} -> {after}");
            Ok(())
        }
        Commands::Text {
            target,
            address,
            c_string,
        } => {
            let process = attach(&context, Some(target), &config)?;
            let bytes = if c_string {
                process.read_c_bytes(address, config.max_cstring)?
            } else {
                let layout = StringLayout::from_descriptor(process.descriptor()?, process.pointer_width())?;
                process.read_std_string(address, &layout)?
            };
            println!("{}", String::from_utf8_lossy(&bytes));
            Ok(())
        }
        Commands::Vector {
            target,
            address,
            element_size,
            limit,
        } => {
            let process = attach(&context, Some(target), &config)?;
            let scope = process.suspend_scope()?;
            let vector = RemoteVector::new(&process, address, element_size)?;
            let header = vector.header()?;
            let len = vector.len()?;
            println!(
                "begin {} end {} capacity_end {} ({len} of {} elements)",
                header.begin,
                header.end,
                header.capacity_end,
                vector.capacity()?
            );
            for index in 0..len.min(limit) {
                let element = vector.at(index)?;
                print!("{}", format_hexdump(element, &vector.read_element(index)?, 16));
            }
            if len > limit {
                println!("... {} more", len - limit);
            }
            scope.release()?;
            Ok(())
        }
        Commands::Class { target, address } => {
            let process = attach(&context, Some(target), &config)?;
            let scheme = match process.descriptor() {
                Ok(info) => ClassNameScheme::from_descriptor(info)?,
                Err(BurrowError::UnknownVersion(_)) => ClassNameScheme::Itanium,
                Err(e) => return Err(e.into()),
            };
            let resolver = ClassNameResolver::new(scheme);
            println!("{}", process.read_class_name(address, &resolver)?);
            Ok(())
        }
        Commands::Find {
            target,
            address,
            length,
            pattern,
        } => {
            let process = attach(&context, Some(target), &config)?;
            let pattern = parse_hex_bytes(&pattern)?;
            match find_pattern(&process, address, length, &pattern)? {
                Some(found) => println!("{found}"),
                None => {
                    return Err(format!("pattern not found in {length} bytes at {address}").into());
                }
            }
            Ok(())
        }
    }
}

fn build_context(offsets: Option<PathBuf>) -> CliResult<Context>
{
    match offsets {
        Some(path) => {
            let table = VersionTable::load(&path)
                .map_err(|e| format!("failed to load version table {}: {e}", path.display()))?;
            debug!(path = %path.display(), versions = table.len(), "loaded version table");
            Ok(Context::with_versions(table))
        }
        None => Ok(Context::new()),
    }
}

fn attach(context: &Context, target: Option<String>, config: &ToolkitConfig) -> CliResult<Process>
{
    let selector = target
        .or_else(|| config.target.clone())
        .ok_or("no target given and BURROW_TARGET is not set")?;
    let selector = TargetSelector::from(selector.as_str());
    info!(%selector, "attaching");
    Ok(context.attach(selector)?)
}

fn print_info(process: &Process) -> CliResult<()>
{
    println!("Process {}", process.pid());
    println!("  Executable:    {}", process.executable()?.display());
    println!("  Pointer width: {}", process.pointer_width());
    println!("  Fingerprint:   {}", process.fingerprint().unwrap_or("unknown"));
    match process.descriptor() {
        Ok(info) => println!("  Version:       {}", info.version()),
        Err(e) => println!("  Version:       {e}"),
    }
    match process.image_base()? {
        Some(base) => println!("  Image base:    {base}"),
        None => println!("  Image base:    not found"),
    }
    println!("  State:         {}", process.run_state());
    println!("  Threads:       {}", process.threads()?.len());
    println!("  Regions:       {}", process.memory_regions()?.len());
    Ok(())
}

fn read_value(process: &Process, address: Address, width: Width) -> CliResult<String>
{
    let text = match width {
        Width::U8 => format!("{0} (0x{0:02x})", process.read_u8(address)?),
        Width::U16 => format!("{0} (0x{0:04x})", process.read_u16(address)?),
        Width::U32 => format!("{0} (0x{0:08x})", process.read_u32(address)?),
        Width::U64 => format!("{0} (0x{0:016x})", process.read_u64(address)?),
        Width::F32 => process.read_f32(address)?.to_string(),
        Width::F64 => process.read_f64(address)?.to_string(),
        Width::Ptr => process.read_pointer(address)?.to_string(),
    };
    Ok(text)
}

fn write_value(process: &Process, address: Address, width: Width, value: &str) -> CliResult<()>
{
    match width {
        Width::U8 => process.write_u8(address, parse_unsigned(value, u8::MAX.into())? as u8)?,
        Width::U16 => process.write_u16(address, parse_unsigned(value, u16::MAX.into())? as u16)?,
        Width::U32 => process.write_u32(address, parse_unsigned(value, u32::MAX.into())? as u32)?,
        Width::U64 => process.write_u64(address, parse_unsigned(value, u64::MAX)?)?,
        Width::F32 => process.write_f32(address, value.trim().parse()?)?,
        Width::F64 => process.write_f64(address, value.trim().parse()?)?,
        Width::Ptr => process.write_pointer(address, parse_address(value)?)?,
    }
    Ok(())
}

/// Integer from hex (`0x2a`), decimal, or negative decimal (two's complement).
fn parse_unsigned(text: &str, max: u64) -> Result<u64, String>
{
    let text = text.trim();
    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("'{text}': {e}"))?
    } else if let Some(negative) = text.strip_prefix('-') {
        let magnitude: u64 = negative.parse().map_err(|e| format!("'{text}': {e}"))?;
        // two's complement within the target width
        let bits = 64 - max.leading_zeros();
        let limit = 1u128 << (bits - 1);
        if u128::from(magnitude) > limit {
            return Err(format!("'{text}' does not fit in {bits} bits"));
        }
        magnitude.wrapping_neg() & max
    } else {
        text.parse().map_err(|e| format!("'{text}': {e}"))?
    };
    if value > max {
        return Err(format!("'{text}' does not fit in {} bits", 64 - max.leading_zeros()));
    }
    Ok(value)
}

fn parse_address(text: &str) -> Result<Address, String>
{
    parse_unsigned(text, u64::MAX).map(Address::new)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_address()
    {
        assert_eq!(parse_address("0x1000").unwrap(), Address::new(0x1000));
        assert_eq!(parse_address("4096").unwrap(), Address::new(4096));
        assert!(parse_address("0xzz").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_parse_unsigned_ranges()
    {
        assert_eq!(parse_unsigned("0x2A", u32::MAX.into()).unwrap(), 0x2A);
        assert_eq!(parse_unsigned("255", u8::MAX.into()).unwrap(), 255);
        assert!(parse_unsigned("256", u8::MAX.into()).is_err());
        assert_eq!(parse_unsigned("-1", u8::MAX.into()).unwrap(), 0xFF);
        assert_eq!(parse_unsigned("-128", u8::MAX.into()).unwrap(), 0x80);
        assert!(parse_unsigned("-129", u8::MAX.into()).is_err());
        assert_eq!(parse_unsigned("-1", u64::MAX).unwrap(), u64::MAX);
    }

    #[test]
    fn test_cli_parses_subcommands()
    {
        let cli = Cli::try_parse_from(["burrow", "-vv", "write", "Dwarf_Fortress", "0x1000", "-5", "--width", "u16"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Write {
                target,
                address,
                value,
                width,
            } => {
                assert_eq!(target, "Dwarf_Fortress");
                assert_eq!(address, Address::new(0x1000));
                assert_eq!(value, "-5");
                assert_eq!(width, Width::U16);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["burrow", "vector", "1234", "0x20", "--element-size", "8"]).unwrap();
        assert!(matches!(cli.command, Commands::Vector { element_size: 8, limit: 16, .. }));
    }

    #[test]
    fn test_cli_rejects_bad_width()
    {
        assert!(Cli::try_parse_from(["burrow", "read", "1", "0x10", "--width", "u128"]).is_err());
    }
}
