//! The datalogger facade.
//!
//! [`Datalogger`](Datalogger) wraps a [`PakBus`](crate::transport::PakBus)
//! transport and exposes the operations a CR1000-family logger
//! supports: clock access, settings, the file system, table
//! definitions and data collection. Table definitions and settings are
//! fetched once and cached for the lifetime of the value.

use std::time::Duration;

use chrono::NaiveDateTime;
use log::{debug, info};

use crate::collect::{parse_collect_data, Fragment, FragmentData, Record};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::link::{link_from_url, Link};
use crate::message::{CollectMode, Message, ProgStats, Setting};
use crate::tabledef::{parse_directory, parse_tabledefs, TableDef};
use crate::transport::{PakBus, DEST_NODE, FILE_SWATH, SECURITY_CODE, SRC_NODE};
use crate::types::NSec;

/// Number of hello attempts before a connection is declared dead.
const HELLO_RETRIES: usize = 20;

/// Addressing and security parameters of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Node id of the logger.
    pub dest_node: u16,
    /// Node id this client claims.
    pub src_node: u16,
    /// Security code configured on the logger, zero for none.
    pub security_code: u16,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            dest_node: DEST_NODE,
            src_node: SRC_NODE,
            security_code: SECURITY_CODE,
        }
    }
}

/// A connected CR1000-family datalogger.
pub struct Datalogger<L: Link> {
    bus: PakBus<L>,
    connected: bool,
    settings: Option<Vec<Setting>>,
    tables: Option<Vec<TableDef>>,
}

impl Datalogger<Box<dyn Link>> {
    /// Connects over a `tcp:` or `serial:` URL (see
    /// [`link_from_url`](link_from_url)).
    pub fn from_url(url: &str, timeout: Duration, options: DeviceOptions) -> Result<Self> {
        let link = link_from_url(url, timeout)?;
        Datalogger::connect(link, options)
    }
}

impl<L: Link> Datalogger<L> {
    /// Opens the link and performs the hello handshake, retrying with
    /// a fresh link a bounded number of times before giving up with
    /// [`NoDevice`](Error::NoDevice).
    pub fn connect(mut link: L, options: DeviceOptions) -> Result<Self> {
        link.open()?;
        let mut device = Datalogger {
            bus: PakBus::new(
                link,
                options.dest_node,
                options.src_node,
                options.security_code,
            ),
            connected: false,
            settings: None,
            tables: None,
        };

        for attempt in 1..=HELLO_RETRIES {
            match device.ping_node() {
                Ok(()) => {
                    device.connected = true;
                    break;
                }
                Err(Error::NoDevice) => {
                    debug!("hello attempt {}/{} failed", attempt, HELLO_RETRIES);
                    device.bus.link_mut().close();
                    device.bus.link_mut().open()?;
                }
                Err(e) => return Err(e),
            }
        }
        if !device.connected {
            return Err(Error::NoDevice);
        }
        Ok(device)
    }

    /// Whether the session is still open (no bye sent yet).
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// One hello round-trip, confirming the node answers.
    pub fn ping_node(&mut self) -> Result<()> {
        let (packet, tran) = self.bus.hello_cmd();
        match self.bus.send_wait(&packet, tran)? {
            Some(_) => Ok(()),
            None => Err(Error::NoDevice),
        }
    }

    fn round_trip(&mut self, packet: Vec<u8>, tran: u8) -> Result<(Header, Message, Duration)> {
        match self.bus.send_wait(&packet, tran)? {
            Some(response) => Ok(response),
            None => Err(Error::Timeout(tran)),
        }
    }

    fn unexpected(msg: Message, tran: u8) -> Error {
        match msg {
            Message::Unsupported {
                hi_proto, msg_type, ..
            } => Error::Unsupported { hi_proto, msg_type },
            _ => Error::BadData(format!("unexpected response to transaction {}", tran)),
        }
    }

    /// Reads the device clock, compensated by the estimated one-way
    /// transit time.
    pub fn get_time(&mut self) -> Result<NaiveDateTime> {
        self.ping_node()?;
        info!("reading the device clock");
        let (time, transit) = self.read_clock(NSec::default())?;
        Ok(time - chrono::Duration::seconds(transit.as_secs() as i64))
    }

    /// Sets the device clock to `time` and returns the re-read clock,
    /// compensated by both observed transits.
    pub fn set_time(&mut self, time: NaiveDateTime) -> Result<NaiveDateTime> {
        let current = self.get_time()?;
        self.ping_node()?;
        info!("adjusting the device clock");
        let delta = time.signed_duration_since(current);
        let (_, transit1) = self.read_clock(NSec::new(delta.num_seconds() as i32, 0))?;
        let (new_time, transit2) = self.read_clock(NSec::default())?;
        let transit = transit1.as_secs() + transit2.as_secs();
        Ok(new_time - chrono::Duration::seconds(transit as i64))
    }

    /// One clock transaction; the returned time is the device clock
    /// before `adjustment` was applied.
    fn read_clock(&mut self, adjustment: NSec) -> Result<(NaiveDateTime, Duration)> {
        let (packet, tran) = self.bus.clock_cmd(adjustment);
        let (_, msg, transit) = self.round_trip(packet, tran)?;
        let clock = match msg {
            Message::Clock(clock) => clock,
            msg => return Err(Self::unexpected(msg, tran)),
        };
        let time = clock
            .time
            .to_datetime()
            .ok_or_else(|| Error::BadData("device time out of range".into()))?;
        Ok((time, transit))
    }

    /// The device settings block, fetched once and cached.
    pub fn settings(&mut self) -> Result<&[Setting]> {
        if self.settings.is_none() {
            self.ping_node()?;
            info!("reading device settings");
            let (packet, tran) = self.bus.getsettings_cmd();
            let (_, msg, _) = self.round_trip(packet, tran)?;
            let response = match msg {
                Message::Settings(response) => response,
                msg => return Err(Self::unexpected(msg, tran)),
            };
            let entries = response.report.map(|r| r.settings).unwrap_or_default();
            self.settings = Some(entries);
        }
        match &self.settings {
            Some(settings) => Ok(settings),
            None => unreachable!(),
        }
    }

    /// Uploads a whole file, chunk by chunk. Every chunk of one file
    /// travels under the same transaction number.
    pub fn get_file(&mut self, filename: &str) -> Result<Vec<u8>> {
        self.ping_node()?;
        info!("uploading file {:?}", filename);
        let mut data = Vec::new();
        let mut tran = None;
        loop {
            let (packet, t) =
                self.bus
                    .fileupload_cmd(filename, data.len() as u32, FILE_SWATH, false, tran);
            tran = Some(t);
            let (_, msg, _) = self.round_trip(packet, t)?;
            let chunk = match msg {
                Message::FileUpload(chunk) => chunk,
                msg => return Err(Self::unexpected(msg, t)),
            };
            if chunk.resp_code == 1 {
                return Err(Error::PermissionDenied(filename.into()));
            }
            if chunk.data.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    /// Names of the files stored on the logger.
    pub fn list_files(&mut self) -> Result<Vec<String>> {
        let data = self.get_file(".DIR")?;
        let directory = parse_directory(&data)?;
        Ok(directory.files.into_iter().map(|f| f.name).collect())
    }

    /// The table definitions, fetched once and cached.
    pub fn table_defs(&mut self) -> Result<&[TableDef]> {
        if self.tables.is_none() {
            let data = self.get_file(".TDF")?;
            self.tables = Some(parse_tabledefs(&data)?);
        }
        match &self.tables {
            Some(tables) => Ok(tables),
            None => unreachable!(),
        }
    }

    /// Names of the data tables defined on the logger.
    pub fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self.table_defs()?.iter().map(|t| t.name.clone()).collect())
    }

    /// One collect-data round trip against `table`.
    fn collect_once(
        &mut self,
        table: &str,
        window: Option<(NSec, NSec)>,
    ) -> Result<(Vec<Fragment>, bool)> {
        let (table_nbr, signature) = {
            let defs = self.table_defs()?;
            let index = defs
                .iter()
                .position(|t| t.name == table)
                .ok_or_else(|| Error::TableNotFound(table.into()))?;
            ((index + 1) as u16, defs[index].signature)
        };

        let mode = match window {
            Some((from, to)) => CollectMode::TimeRange(from, to),
            None => CollectMode::All,
        };
        let (packet, tran) = self.bus.collectdata_cmd(table_nbr, signature, mode);
        let (_, msg, _) = self.round_trip(packet, tran)?;
        let response = match msg {
            Message::CollectData(response) => response,
            msg => return Err(Self::unexpected(msg, tran)),
        };
        if response.resp_code != 0 {
            debug!("collect-data response code {}", response.resp_code);
        }

        let defs = match &self.tables {
            Some(tables) => tables,
            None => unreachable!(),
        };
        parse_collect_data(&response.data, defs)
    }

    /// Streams records of `table` stamped within `[start, stop]` in
    /// batches, one collect-data round trip per batch.
    ///
    /// `start` defaults to one second past the PakBus epoch, `stop` to
    /// the current wall clock.
    pub fn collect(
        &mut self,
        table: &str,
        start: Option<NaiveDateTime>,
        stop: Option<NaiveDateTime>,
    ) -> Result<Collect<'_, L>> {
        self.ping_node()?;
        info!("collecting records from table {:?}", table);
        let start = start.unwrap_or_else(|| {
            // one second past the epoch, always representable
            NSec::new(1, 0).to_datetime().unwrap()
        });
        let stop = stop.unwrap_or_else(|| chrono::Local::now().naive_local());
        Ok(Collect {
            device: self,
            table: table.into(),
            start,
            stop,
            more: true,
        })
    }

    /// Collects every record of `table` within `[start, stop]`.
    pub fn get_data(
        &mut self,
        table: &str,
        start: Option<NaiveDateTime>,
        stop: Option<NaiveDateTime>,
    ) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut batches = self.collect(table, start, stop)?;
        while let Some(batch) = batches.next() {
            records.extend(batch?);
        }
        Ok(records)
    }

    /// Dumps every record fragment of `table` without decoding,
    /// paging with collect-all commands until the logger reports no
    /// further records.
    pub fn get_raw_fragments(&mut self, table: &str) -> Result<Vec<Fragment>> {
        self.ping_node()?;
        let mut fragments = Vec::new();
        loop {
            let (mut batch, more) = self.collect_once(table, None)?;
            fragments.append(&mut batch);
            if !more {
                break;
            }
        }
        Ok(fragments)
    }

    /// The logger's programming statistics.
    pub fn prog_stats(&mut self) -> Result<ProgStats> {
        self.ping_node()?;
        info!("reading programming statistics");
        let (packet, tran) = self.bus.getprogstat_cmd();
        let (_, msg, _) = self.round_trip(packet, tran)?;
        let response = match msg {
            Message::ProgStats(response) => response,
            msg => return Err(Self::unexpected(msg, tran)),
        };
        let resp_code = response.resp_code;
        response.stats.ok_or_else(|| {
            Error::BadData(format!(
                "programming statistics refused with code {}",
                resp_code
            ))
        })
    }

    /// Ends the session. Idempotent; also sent when the value is
    /// dropped. The peer does not acknowledge a bye.
    pub fn bye(&mut self) -> Result<()> {
        if self.connected {
            info!("closing the session");
            let (packet, _) = self.bus.bye_cmd();
            self.bus.send(&packet)?;
            self.connected = false;
        }
        Ok(())
    }
}

impl<L: Link> Drop for Datalogger<L> {
    fn drop(&mut self) {
        let _ = self.bye();
    }
}

/// Iterator over batches of collected records, one collect-data round
/// trip per batch. See [`Datalogger::collect`](Datalogger::collect).
pub struct Collect<'a, L: Link> {
    device: &'a mut Datalogger<L>,
    table: String,
    start: NaiveDateTime,
    stop: NaiveDateTime,
    more: bool,
}

impl<'a, L: Link> Iterator for Collect<'a, L> {
    type Item = Result<Vec<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.more {
            return None;
        }

        let window = (
            NSec::from_datetime(self.start),
            NSec::from_datetime(self.stop),
        );
        let (fragments, more) = match self.device.collect_once(&self.table, Some(window)) {
            Ok(result) => result,
            Err(e) => {
                self.more = false;
                return Some(Err(e));
            }
        };
        self.more = more;

        let mut batch = Vec::new();
        let last_fragment = fragments.len().saturating_sub(1);
        for (i, fragment) in fragments.into_iter().enumerate() {
            let records = match fragment.data {
                FragmentData::Records(records) if !records.is_empty() => records,
                _ => {
                    self.more = false;
                    break;
                }
            };
            let last_record = records.len() - 1;
            for (j, record) in records.into_iter().enumerate() {
                if record.time < self.start || record.time > self.stop {
                    continue;
                }
                self.start = record.time;
                // The next request's window starts at the last emitted
                // time, so the boundary record would come back again;
                // leave it to the next batch.
                if self.more && i == last_fragment && j == last_record {
                    break;
                }
                batch.push(record);
            }
        }

        if batch.is_empty() {
            self.more = false;
            return None;
        }
        batch.sort_by_key(|r| r.time);
        Some(Ok(batch))
    }
}
