use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::LevelFilter;
use pakbus::{Datalogger, DeviceOptions, Record};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Communication tool for Campbell Scientific CR1000-family dataloggers speaking PakBus over TCP or serial links."
)]
struct Opt {
    #[structopt(
        long,
        help = "Connection URL, e.g. tcp:192.168.0.21:6785 or serial:/dev/ttyUSB0:19200:8N1"
    )]
    url: String,

    #[structopt(long, default_value = "10", help = "Link read timeout in seconds")]
    timeout: u64,

    #[structopt(long, default_value = "0x802", parse(try_from_str = parse_node), help = "Source node id")]
    src: u16,

    #[structopt(long, default_value = "0x001", parse(try_from_str = parse_node), help = "Destination node id")]
    dest: u16,

    #[structopt(long, default_value = "0", parse(try_from_str = parse_node), help = "Datalogger security code")]
    code: u16,

    #[structopt(long, help = "Log the wire traffic to stderr")]
    debug: bool,

    #[structopt(long, default_value = ",", help = "Column delimiter for tabular output")]
    delim: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    #[structopt(about = "Print the current datetime of the datalogger")]
    Gettime,

    #[structopt(about = "Set the datalogger clock to the given datetime")]
    Settime {
        #[structopt(help = "Datetime like \"2012-07-26 14:00\"")]
        datetime: String,
    },

    #[structopt(about = "Print the programming statistics of the datalogger")]
    Getprogstat,

    #[structopt(about = "Dump the datalogger settings")]
    Getsettings {
        #[structopt(long, help = "File the table is written to, stdout by default")]
        output: Option<PathBuf>,
    },

    #[structopt(about = "List the files stored on the datalogger")]
    Listfiles,

    #[structopt(about = "Download a file from the datalogger")]
    Getfile {
        filename: String,
        output: PathBuf,
    },

    #[structopt(about = "List the data tables defined on the datalogger")]
    Listtables,

    #[structopt(about = "Download records of a table between two datetimes")]
    Getdata {
        table: String,
        output: PathBuf,
        #[structopt(long, help = "First record datetime, the epoch by default")]
        start: Option<String>,
        #[structopt(long, help = "Last record datetime, now by default")]
        stop: Option<String>,
    },
}

fn parse_node(s: &str) -> std::result::Result<u16, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .with_context(|| format!("{:?} is not a datetime like \"2012-07-26 14:00\"", s))
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    env_logger::Builder::from_default_env()
        .filter_level(if opt.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .init();

    let link = pakbus::link_from_url(&opt.url, Duration::from_secs(opt.timeout))?;
    let options = DeviceOptions {
        dest_node: opt.dest,
        src_node: opt.src,
        security_code: opt.code,
    };
    let mut logger = Datalogger::connect(link, options)
        .with_context(|| format!("failed to connect over {}", opt.url))?;

    let delim = match opt.delim.as_str() {
        "\\t" => "\t".to_string(),
        d => d.to_string(),
    };

    match opt.command {
        Command::Gettime => {
            println!("{}", logger.get_time()?);
        }

        Command::Settime { datetime } => {
            let target = parse_datetime(&datetime)?;
            let old = logger.get_time()?;
            let new = logger.set_time(target)?;
            println!("Old time : {}", old);
            println!("Current time : {}", new);
        }

        Command::Getprogstat => {
            let stats = logger.prog_stats()?;
            println!("OSVersion : {}", stats.os_version);
            println!("OSSignature : {}", stats.os_signature);
            println!("SerialNumber : {}", stats.serial_number);
            println!("PowUpProg : {}", stats.power_up_program);
            println!("CompState : {}", stats.compile_state);
            println!("ProgName : {}", stats.program_name);
            println!("ProgSignature : {}", stats.program_signature);
            println!("CompTime : {}", stats.compile_time);
            println!("CompResult : {}", stats.compile_result.trim_end());
        }

        Command::Getsettings { output } => {
            let mut out = open_output(output.as_deref())?;
            writeln!(
                out,
                "SettingId{d}ReadOnly{d}LargeValue{d}SettingValue",
                d = delim
            )?;
            for setting in logger.settings()? {
                let value = setting
                    .value
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(
                    out,
                    "{}{d}{}{d}{}{d}{}",
                    setting.id,
                    setting.read_only as u8,
                    setting.large_value as u8,
                    value,
                    d = delim
                )?;
            }
        }

        Command::Listfiles => {
            for filename in logger.list_files()? {
                println!("{}", filename);
            }
        }

        Command::Getfile { filename, output } => {
            let data = logger.get_file(&filename)?;
            std::fs::write(&output, &data)
                .with_context(|| format!("failed to write {:?}", output))?;
            println!("{} bytes written to {:?}", data.len(), output);
        }

        Command::Listtables => {
            for table in logger.list_tables()? {
                println!("{}", table);
            }
        }

        Command::Getdata {
            table,
            output,
            start,
            stop,
        } => {
            let start = start.as_deref().map(parse_datetime).transpose()?;
            let stop = stop.as_deref().map(parse_datetime).transpose()?;
            let mut out = File::create(&output)
                .with_context(|| format!("failed to create {:?}", output))?;

            println!("Your download is starting.");
            let mut total = 0usize;
            let mut header_written = false;
            let mut batches = logger.collect(&table, start, stop)?;
            for (i, batch) in (&mut batches).enumerate() {
                let records = batch?;
                println!("Packet {} with {} records", i, records.len());
                total += records.len();
                write_records(&mut out, &records, &delim, !header_written)?;
                header_written = true;
            }
            println!("---------------------------");
            match total {
                0 => println!("No new records were found"),
                1 => println!("1 new record was found"),
                n => println!("{} new records were found", n),
            }
        }
    }

    logger.bye()?;
    Ok(())
}

fn open_output(path: Option<&std::path::Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => {
            Box::new(File::create(path).with_context(|| format!("failed to create {:?}", path))?)
        }
        None => Box::new(std::io::stdout()),
    })
}

fn write_records(
    out: &mut dyn Write,
    records: &[Record],
    delim: &str,
    header: bool,
) -> Result<()> {
    if header {
        if let Some(first) = records.first() {
            let mut columns = vec!["Datetime".to_string(), "RecNbr".to_string()];
            columns.extend(first.fields.iter().map(|(name, _)| name.clone()));
            writeln!(out, "{}", columns.join(delim))?;
        }
    }
    for record in records {
        let mut row = vec![record.time.to_string(), record.rec_nbr.to_string()];
        row.extend(record.fields.iter().map(|(_, value)| value.to_string()));
        writeln!(out, "{}", row.join(delim))?;
    }
    Ok(())
}
