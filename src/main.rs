use std::{
    io::{self, IsTerminal},
    path::PathBuf,
    process::{self, ExitCode},
};

use clap::{ArgAction, Parser};
use packetdump::{
    config::parse_size, dump, CaptureConfig, Device, FileSummary, LibpcapProvider, Provider,
    StopRequest, StopToken,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "packetdump")]
#[command(about = "Captures packets into rotating, optionally LZ4-compressed, pcap files")]
struct Args {
    /// Sniff on this network interface (default: the first one listed)
    #[arg(short, long)]
    interface: Option<String>,

    /// Write packets to files named by this pattern; %Y %y %m %d %H %M %S expand to the
    /// time of each file's first packet. A .lz4 suffix enables compression
    #[arg(short = 'w', long = "writefile", value_name = "PATTERN")]
    writefile: Option<String>,

    /// Rotate once a file reaches this many bytes (k, m and g suffixes accepted)
    #[arg(short = 'C', long = "filesize", value_parser = parse_size, default_value = "0")]
    filesize: u64,

    /// Rotate on every multiple of this many seconds
    #[arg(short = 'G', long = "filetime", value_name = "SECONDS", default_value_t = 0)]
    filetime: u64,

    /// Keep only this many of the files this run creates
    #[arg(short = 'W', long = "maxfiles", value_name = "COUNT", default_value_t = 0)]
    maxfiles: usize,

    /// Compress output with LZ4. Not needed if the file suffix is .lz4
    #[arg(short = 'z', long)]
    compress: bool,

    /// Expand filename times in UTC instead of local time
    #[arg(long)]
    gmt: bool,

    /// BPF filter expression
    #[arg(long, value_name = "EXPR")]
    bpf: Option<String>,

    /// Read the BPF filter expression from this file
    #[arg(short = 'F', long = "bpf-file", value_name = "FILE")]
    bpf_file: Option<PathBuf>,

    /// On WiFi interfaces, sets rfmon mode
    #[arg(short = 'I', long = "monitor-mode")]
    monitor_mode: bool,

    /// Do NOT put the adapter into promiscuous mode
    #[arg(short = 'p', long = "no-promiscuous-mode")]
    no_promiscuous_mode: bool,

    /// Read packets from capture files instead of an interface. Without -w, prints a
    /// summary of each file
    #[arg(short = 'r', long = "readfile", value_name = "FILE")]
    readfile: Vec<PathBuf>,

    /// Drop root privileges to this user once capture has started
    #[arg(short = 'Z', long = "relinquish-privileges", value_name = "USER")]
    relinquish_privileges: Option<String>,

    /// Print the list of capture interfaces
    #[arg(short = 'D', long = "list-interfaces")]
    list_interfaces: bool,

    /// Print the configuration and exit
    #[arg(long)]
    echo: bool,

    /// Print version information
    #[arg(long)]
    version: bool,

    /// Maximum number of bytes captured per packet
    #[arg(short = 's', long, default_value_t = 65536)]
    snaplen: i32,

    /// Don't show the packets/drops status line
    #[arg(long)]
    no_status: bool,

    /// More logging; repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> Result<CaptureConfig, packetdump::Error> {
        let mut builder = CaptureConfig::builder(self.writefile.clone().unwrap_or_default())
            .rotate_bytes(self.filesize)
            .rotate_seconds(self.filetime)
            .max_files(self.maxfiles)
            .compress(self.compress)
            .utc(self.gmt)
            .snaplen(self.snaplen)
            .promisc(!self.no_promiscuous_mode)
            .monitor_mode(self.monitor_mode)
            .status_line(!self.no_status && io::stderr().is_terminal());
        if let Some(interface) = &self.interface {
            builder = builder.interface(interface);
        }
        if let Some(bpf) = &self.bpf {
            builder = builder.bpf(bpf);
        }
        if let Some(path) = &self.bpf_file {
            builder = builder.bpf_file(path);
        }
        if let Some(user) = &self.relinquish_privileges {
            builder = builder.drop_user(user);
        }
        for path in &self.readfile {
            builder = builder.read_file(path);
        }
        builder.build()
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn print_version(provider: &LibpcapProvider) {
    println!("packetdump version = {}", env!("CARGO_PKG_VERSION"));
    match provider.version() {
        Ok(version) => println!("{}", version),
        Err(e) => println!("{}", e),
    }
    println!("LZ4 = lz4_flex (frame format)");
}

fn list_interfaces(provider: &LibpcapProvider) -> ExitCode {
    match Device::list(provider) {
        Ok(devices) if devices.is_empty() => {
            eprintln!("no adapters found, are you sure you are root?");
            ExitCode::FAILURE
        }
        Ok(devices) => {
            for (index, device) in devices.iter().enumerate() {
                println!(" {}  {}", index, device);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn summarize(paths: &[PathBuf]) -> ExitCode {
    let mut status = ExitCode::SUCCESS;
    for path in paths {
        match FileSummary::read(path) {
            Ok(summary) => println!("{}", summary),
            Err(e) => {
                eprintln!("{}", e);
                status = ExitCode::FAILURE;
            }
        }
    }
    status
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    let provider = LibpcapProvider::shared();

    if args.version || args.list_interfaces || args.echo {
        let mut status = ExitCode::SUCCESS;
        if args.version {
            print_version(provider);
        }
        if args.list_interfaces {
            status = list_interfaces(provider);
        }
        if args.echo {
            match args.config() {
                Ok(config) => print!("{}", config),
                Err(e) => {
                    eprintln!("{}", e);
                    status = ExitCode::FAILURE;
                }
            }
        }
        return status;
    }

    if args.writefile.is_none() {
        if !args.readfile.is_empty() {
            return summarize(&args.readfile);
        }
        eprintln!("FAIL: no output files specified");
        eprintln!("  hint: use the '-w' option to specify a file pattern");
        return ExitCode::FAILURE;
    }

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if !config.is_replay() {
        if let Some(e) = provider.load_error() {
            eprintln!("FAIL: libpcap: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let stop = StopToken::new();
    let handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || match handler.request_stop() {
        StopRequest::Graceful => {
            eprintln!("finishing the current file, press Ctrl-C again to exit immediately")
        }
        StopRequest::Immediate => process::exit(130),
    }) {
        tracing::warn!("couldn't trap Ctrl-C: {}", e);
    }

    match dump::run(&config, provider, &stop) {
        Ok(summary) => {
            if config.status_line {
                eprintln!();
            }
            match summary.stats {
                Some(stat) => eprintln!(
                    "read {} packets, {} dropped",
                    summary.packets,
                    stat.total_dropped()
                ),
                None => eprintln!("read {} packets", summary.packets),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
