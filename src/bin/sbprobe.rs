use std::io::{self, BufRead, Write};
use std::iter::Peekable;
use std::str::SplitWhitespace;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use sbus_probe::connection::ConnectionManager;
use sbus_probe::{ConnectionParams, Gateway, ReadParamValidator, Row, WriteParamValidator};

#[derive(Parser, Debug)]
#[command(
    name = "sbprobe",
    version,
    about = "Read and write S-Bus field devices over Ethernet"
)]
struct Cli {
    /// Host name or IP address of the station.
    #[arg(long, env = "SBPROBE_HOST", default_value = "localhost")]
    host: String,

    /// TCP port of the station.
    #[arg(short = 'r', long, env = "SBPROBE_PORT", default_value_t = 5050)]
    port: u16,

    /// Station address, 0 to 255.
    #[arg(short = 'u', long, env = "SBPROBE_STATION", default_value_t = 1)]
    station: i64,

    /// Connect and response timeout in seconds.
    #[arg(short = 't', long, env = "SBPROBE_TIMEOUT", default_value_t = 5.0)]
    timeout: f64,

    /// Reconnect and retry once when a request fails.
    #[arg(
        short = 'a',
        long,
        env = "SBPROBE_AUTO_RECONNECT",
        value_enum,
        ignore_case = true,
        default_value = "y"
    )]
    auto_reconnect: YesNo,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum YesNo {
    Y,
    N,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read values, given as TYPE:ADDR (e.g. Register:100 Flag:10).
    Read {
        #[arg(required = true, value_name = "TYPE:ADDR")]
        items: Vec<String>,
    },
    /// Write values, given as TYPE:ADDR=VALUE (e.g. Output:3=1).
    Write {
        #[arg(required = true, value_name = "TYPE:ADDR=VALUE")]
        items: Vec<String>,
    },
    /// Interactive shell.
    Shell,
}

fn read_row(item: &str) -> Row {
    match item.split_once(':') {
        Some((addr_type, addr)) => Row::new(addr_type, addr, ""),
        None => Row::new(item, "", ""),
    }
}

fn write_row(item: &str) -> Row {
    let (addr_type, rest) = item.split_once(':').unwrap_or((item, ""));
    let (addr, value) = rest.split_once('=').unwrap_or((rest, ""));
    Row::new(addr_type, addr, value)
}

fn print_rows(rows: &[Row]) -> Result<()> {
    let mut failed = 0;
    for row in rows {
        if row.error.is_empty() {
            println!("{:<8} {:>5}  {}", row.addr_type, row.address, row.data);
        } else {
            failed += 1;
            println!("{:<8} {:>5}  error: {}", row.addr_type, row.address, row.error);
        }
    }
    if failed > 0 {
        bail!("{} of {} rows failed", failed, rows.len());
    }
    Ok(())
}

fn print_status(gateway: &Gateway) {
    let page = gateway.connection_page();
    println!(
        "{} ({}:{}, station {}, timeout {} s, auto reconnect {})",
        page["connectionstat"],
        page["host"],
        page["port"],
        page["unitid"],
        page["timeout"],
        if page["autoconnectstat"].is_empty() { "off" } else { "on" },
    );
    if !page["connecterror"].is_empty() {
        println!("{}", page["connecterror"]);
    }
}

fn cmd_read(args: &mut CmdScanner, gateway: &Gateway) -> Result<()> {
    let row = Row::new(args.next()?, args.next()?, "");
    print_rows(&gateway.read(vec![row]))
}

fn cmd_write(args: &mut CmdScanner, gateway: &Gateway) -> Result<()> {
    let row = Row::new(args.next()?, args.next()?, args.next()?);
    print_rows(&gateway.write(vec![row]))
}

fn print_help() {
    let read: Vec<_> = ReadParamValidator.address_types().collect();
    let write: Vec<_> = WriteParamValidator.address_types().collect();
    println!("read TYPE ADDR         TYPE is one of {}", read.join(", "));
    println!("write TYPE ADDR VALUE  TYPE is one of {}", write.join(", "));
    println!("connect | disconnect | status | quit");
}

fn shell(gateway: &Gateway) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        print!(">> ");
        stdout.flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let mut scan = CmdScanner::new(&line);
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("read") | Ok("r") => cmd_read(&mut scan, gateway),
            Ok("write") | Ok("w") => cmd_write(&mut scan, gateway),
            Ok("connect") => {
                gateway.connect();
                print_status(gateway);
                Ok(())
            }
            Ok("disconnect") => {
                gateway.disconnect();
                print_status(gateway);
                Ok(())
            }
            Ok("status") => {
                print_status(gateway);
                Ok(())
            }
            Ok("help") | Ok("?") => {
                print_help();
                Ok(())
            }
            Ok("quit") | Ok("q") => return Ok(()),
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:#}", err)
        }
    }
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            splt: line.split_whitespace().peekable(),
        }
    }

    fn next(&mut self) -> Result<&'a str> {
        self.splt.next().context("Missing argument")
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let params = ConnectionParams::new(
        cli.host,
        cli.port,
        cli.timeout,
        cli.station,
        cli.auto_reconnect == YesNo::Y,
    )
    .context("Invalid connection parameters")?;
    let gateway = Gateway::new(ConnectionManager::tcp(params));
    gateway.set_version_info(concat!("sbprobe ", env!("CARGO_PKG_VERSION")));

    let state = gateway.connect();
    if state.last_error {
        print_status(&gateway);
    }

    match cli.command {
        Command::Read { items } => {
            let rows = items.iter().map(String::as_str).map(read_row).collect();
            print_rows(&gateway.read(rows))
        }
        Command::Write { items } => {
            let rows = items.iter().map(String::as_str).map(write_row).collect();
            print_rows(&gateway.write(rows))
        }
        Command::Shell => shell(&gateway),
    }
}
