use std::{
    io::{BufRead, Write},
    path::PathBuf,
    sync::{atomic::Ordering, mpsc::Receiver},
    time::Duration,
};

use clap::{Parser, Subcommand};
use kwp2000_flasher::{
    Error,
    actions::DataIdentifier,
    config::FlasherConfig,
    kwp2000::{
        ConnectionStatus,
        client::{Client, ClientEvent},
        constants::baud,
        interface::ConnectMethod,
    },
    memory::{MemoryImage, SharedRegions, TrackedRegions},
    operations::{
        AcceptAll, ExtendedDataLogging, OperationEvent, OperationOutput, PromptAnswer, PromptKind,
        ReadAllEcuIdentification, ReadExternalFlash, RelocateMessageHandlingTable,
        SynchronizeRamRegions, UserPrompt, WriteExternalFlash, sequential,
    },
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Time allowed for a clean StopCommunication before the port is closed
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Parser, Debug)]
#[command(name = "kwp2000-flasher", version, about = "Reads and writes ME7 ECUs over a K-line adapter")]
struct Args {
    /// Configuration file, defaults are used if it does not exist
    #[arg(short, long, default_value = "kwp2000-flasher.toml")]
    config: PathBuf,

    /// Serial port of the adapter
    #[arg(short, long)]
    port: Option<String>,

    /// Connect with fast init instead of slow init
    #[arg(long)]
    fast_init: bool,

    /// ECU address used for the init
    #[arg(long, value_parser = parse_u8)]
    address: Option<u8>,

    /// Session baud rates to try, in order
    #[arg(long, value_delimiter = ',')]
    baud: Vec<u32>,

    /// Log protocol details
    #[arg(short, long)]
    verbose: bool,

    /// Answer every question with yes
    #[arg(short, long)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read every identification option
    Info,
    /// Read the whole flash into a file
    ReadFlash { output: PathBuf },
    /// Write a whole flash image
    WriteFlash {
        input: PathBuf,
        /// Program sectors even if their checksum already matches
        #[arg(long)]
        force: bool,
        /// Erase the whole flash once instead of sector by sector
        #[arg(long)]
        erase_all: bool,
    },
    /// Read memory by address
    ReadMemory {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        size: u32,
        output: PathBuf,
    },
    /// Write a file to memory by address
    WriteMemory {
        #[arg(value_parser = parse_u32)]
        address: u32,
        input: PathBuf,
    },
    /// Read the serial EEPROM
    ReadEeprom { output: PathBuf },
    /// Read the whole external RAM
    ReadRam { output: PathBuf },
    /// Read every local identifier, or every common identifier
    Identifiers {
        #[arg(long)]
        common: bool,
    },
    /// Read the diagnostic trouble codes
    Dtc,
    /// Clear the diagnostic trouble codes
    ClearDtc,
    /// Compare every sector of an image with the flash
    Checksum { input: PathBuf },
    /// Install the data logging handlers
    Relocate,
    /// Print RAM regions, given as address:size, as they change
    Log {
        #[arg(required = true, value_parser = parse_region)]
        regions: Vec<(u32, u32)>,
        /// Log through the installed variable services instead of memory reads
        #[arg(long)]
        variables: bool,
        /// Stop after this many reads
        #[arg(long)]
        count: Option<usize>,
    },
}

fn parse_u32(value: &str) -> Result<u32, std::num::ParseIntError> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

fn parse_u8(value: &str) -> Result<u8, String> {
    let value = parse_u32(value).map_err(|e| e.to_string())?;
    u8::try_from(value).map_err(|e| e.to_string())
}

fn parse_region(value: &str) -> Result<(u32, u32), String> {
    let (address, size) = value
        .split_once(':')
        .ok_or_else(|| format!("expected address:size, got {value}"))?;
    Ok((
        parse_u32(address).map_err(|e| e.to_string())?,
        parse_u32(size).map_err(|e| e.to_string())?,
    ))
}

/// Asks on the terminal, or says yes to everything with `--yes`.
struct TerminalPrompt {
    assume_yes: bool,
}

impl UserPrompt for TerminalPrompt {
    fn ask(&mut self, title: &str, message: &str, kind: PromptKind) -> PromptAnswer {
        if self.assume_yes {
            return AcceptAll.ask(title, message, kind);
        }
        let choices = match kind {
            PromptKind::OkCancel => "[o]k/[c]ancel",
            PromptKind::YesNoCancel => "[y]es/[n]o/[c]ancel",
        };
        eprintln!("\n{title}\n{message}");
        loop {
            eprint!("{choices}? ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line).unwrap_or(0) == 0 {
                return PromptAnswer::Cancel;
            }
            let answer = match (kind, line.trim().to_ascii_lowercase().as_str()) {
                (PromptKind::OkCancel, "o" | "ok") => PromptAnswer::Ok,
                (PromptKind::YesNoCancel, "y" | "yes") => PromptAnswer::Yes,
                (PromptKind::YesNoCancel, "n" | "no") => PromptAnswer::No,
                (_, "c" | "cancel") => PromptAnswer::Cancel,
                _ => continue,
            };
            return answer;
        }
    }
}

fn show_progress(event: &ClientEvent) {
    match event {
        ClientEvent::Operation(OperationEvent::Progress(progress)) => {
            eprint!("\r{:5.1}%", progress * 100.0);
            let _ = std::io::stderr().flush();
        }
        ClientEvent::Connection(status) => info!(%status, "connection changed"),
        _ => {}
    }
}

fn apply_args(config: &mut FlasherConfig, args: &Args) {
    if let Some(port) = &args.port {
        config.connection.port = port.clone();
    }
    if args.fast_init {
        config.connection.interface.connect_method = ConnectMethod::FastInit;
    }
    if let Some(address) = args.address {
        config.connection.interface.connect_address = address;
    }
    if !args.baud.is_empty() {
        config.session.baud_rates = args.baud.clone();
    }
    if let Command::WriteFlash { force, erase_all, .. } = args.command {
        config.flash.write.check_if_write_required &= !force;
        config.flash.write.erase_entire_flash_at_once |= erase_all;
    }
}

fn main() -> Result<(), Error> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "kwp2000_flasher=debug"
    } else {
        "kwp2000_flasher=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = FlasherConfig::load_or_default(&args.config)?;
    apply_args(&mut config, &args);

    info!(port = %config.connection.port, "opening adapter");
    let port = serialport::new(&config.connection.port, baud::DEFAULT)
        .timeout(Duration::from_millis(config.connection.interface.default_timing.p3_max))
        .flow_control(serialport::FlowControl::None)
        .open_native()?;

    let prompt = TerminalPrompt {
        assume_yes: args.yes,
    };
    let (client, events) = Client::spawn(port, config.connection.interface.clone(), prompt)?;
    let result = run_command(&client, &events, &config, args.command);
    eprintln!();

    if client.status() == ConnectionStatus::Connected {
        client.disconnect();
        wait_for_disconnect(&events);
    }
    client.close();
    result
}

fn wait_for_disconnect(events: &Receiver<ClientEvent>) {
    let deadline = std::time::Instant::now() + DISCONNECT_TIMEOUT;
    while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
        match events.recv_timeout(left) {
            Ok(ClientEvent::Connection(
                ConnectionStatus::Disconnected | ConnectionStatus::CommunicationTerminated,
            )) => return,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    warn!("ECU did not confirm the disconnect");
}

fn run_command<K>(
    client: &Client<K>,
    events: &Receiver<ClientEvent>,
    config: &FlasherConfig,
    command: Command,
) -> Result<(), Error>
where
    K: kwp2000_flasher::k_line::KLine + Send + 'static,
    Error: From<K::Error>,
{
    let session = config.session_settings();
    let layout = &config.flash.layout;
    let run = |operation| client.run_to_completion(events, operation, show_progress);

    match command {
        Command::Info => {
            let operation = ReadAllEcuIdentification::new(None, &session);
            if let OperationOutput::Identification(info) =
                client.run_to_completion(events, operation, show_progress)?
            {
                let key_bytes = client.with_interface(|interface| interface.key_bytes());
                println!("key bytes: {:02x} {:02x}", key_bytes.first, key_bytes.second);
                println!("{info}");
            }
        }
        Command::ReadFlash { output } => {
            layout.validate()?;
            let operation = ReadExternalFlash::layout(&session, config.flash.read, layout);
            if let OperationOutput::Flash(images) =
                client.run_to_completion(events, operation, show_progress)?
            {
                std::fs::write(&output, layout.combine(&images))?;
                info!(file = %output.display(), "flash saved");
            }
        }
        Command::WriteFlash { input, .. } => {
            let data = std::fs::read(&input)?;
            let operation = WriteExternalFlash::layout(&session, config.flash.write, layout, &data)?;
            if let OperationOutput::Flashed(report) =
                client.run_to_completion(events, operation, show_progress)?
            {
                for block in report.failed_blocks() {
                    warn!(
                        start = format_args!("{:#08x}", block.image.start),
                        attempts = block.attempts,
                        "sector was not programmed"
                    );
                }
                if !report.all_successful() {
                    return Err(Error::OperationFailed("WriteExternalFlash".into()));
                }
                info!("flash written");
            }
        }
        Command::ReadMemory {
            address,
            size,
            output,
        } => save_memory(run(sequential::read_memory(&session, address, size))?, &output)?,
        Command::WriteMemory { address, input } => {
            let data = std::fs::read(&input)?;
            run(sequential::write_memory(&session, address, data))?;
            info!("memory written");
        }
        Command::ReadEeprom { output } => {
            save_memory(run(sequential::read_serial_eeprom(&session))?, &output)?
        }
        Command::ReadRam { output } => {
            save_memory(run(sequential::read_external_ram(&session))?, &output)?
        }
        Command::Identifiers { common } => {
            let operation = if common {
                sequential::read_all_common_identifiers(&session)
            } else {
                sequential::read_all_local_identifiers(&session)
            };
            if let OperationOutput::Identifiers(records) = run(operation)? {
                for (identifier, data) in records {
                    let bytes: String = data.iter().map(|b| format!("{b:02x}")).collect();
                    match identifier {
                        DataIdentifier::Local(id) => println!("{id:#04x} {bytes}"),
                        DataIdentifier::Common(id) => println!("{id:#06x} {bytes}"),
                    }
                }
            }
        }
        Command::Dtc => {
            if let OperationOutput::Dtcs(dtcs) = run(sequential::read_dtcs(&session))? {
                if dtcs.is_empty() {
                    println!("no trouble codes stored");
                }
                for dtc in dtcs {
                    println!("{dtc}");
                }
            }
        }
        Command::ClearDtc => {
            run(sequential::clear_dtcs(&session))?;
            info!("trouble codes cleared");
        }
        Command::Checksum { input } => {
            let data = std::fs::read(&input)?;
            for sector in layout.split(&data)? {
                let operation = sequential::flash_checksum_matches(&session, sector.start, &sector.data);
                let matches = matches!(
                    client.run_to_completion(events, operation, show_progress)?,
                    OperationOutput::ChecksumMatches(true)
                );
                println!(
                    "{:#08x} {:#07x} {}",
                    sector.start,
                    sector.size(),
                    if matches { "matches" } else { "differs" }
                );
            }
        }
        Command::Relocate => {
            let payload = config.relocation.data_logging_payload()?.ok_or_else(|| {
                Error::InvalidPayload("the relocation section names no payload files".into())
            })?;
            client.run_to_completion(
                events,
                RelocateMessageHandlingTable::new(&session, payload),
                show_progress,
            )?;
            info!("data logging handlers installed");
        }
        Command::Log {
            regions,
            variables,
            count,
        } => {
            let mut tracked = TrackedRegions::default();
            for (tag, (start, size)) in regions.into_iter().enumerate() {
                tracked.add(start, size, tag as _);
            }
            let tracked = SharedRegions::new(parking_lot::Mutex::new(tracked));
            let abort = if variables {
                let mut operation =
                    ExtendedDataLogging::new(&session, config.logging.variables, tracked);
                if let Some(payload) = config.relocation.data_logging_payload()? {
                    operation = operation.with_relocation(payload);
                }
                client.run(operation)?
            } else {
                client.run(SynchronizeRamRegions::new(&session, config.logging.sync, tracked))?
            };
            log_regions(events, count, || abort.store(true, Ordering::Release))?;
        }
    }
    Ok(())
}

fn save_memory(output: OperationOutput, path: &PathBuf) -> Result<(), Error> {
    if let OperationOutput::Memory(image) = output {
        std::fs::write(path, &image.data)?;
        info!(file = %path.display(), bytes = image.data.len(), "memory saved");
    }
    Ok(())
}

fn log_regions(
    events: &Receiver<ClientEvent>,
    count: Option<usize>,
    stop: impl Fn(),
) -> Result<(), Error> {
    let mut reads = 0;
    loop {
        match events.recv() {
            Ok(ClientEvent::Operation(OperationEvent::RegionsRead(read))) => {
                let line: Vec<String> = read
                    .iter()
                    .map(|region| format_region(&region.image))
                    .collect();
                println!("{}", line.join(" "));
                reads += 1;
                if count.is_some_and(|count| reads >= count) {
                    stop();
                }
            }
            Ok(ClientEvent::OperationFinished { success, name, .. }) => {
                // stopping on purpose fails the operation
                if success || count.is_some_and(|count| reads >= count) {
                    return Ok(());
                }
                return Err(Error::OperationFailed(name.to_string()));
            }
            Ok(event) => show_progress(&event),
            Err(_) => return Err(Error::NotRunning),
        }
    }
}

fn format_region(image: &MemoryImage) -> String {
    let bytes: String = image.data.iter().map(|b| format!("{b:02x}")).collect();
    format!("{:#08x}={bytes}", image.start)
}
