//! # `pakbus`
//!
//! A client for the PakBus protocol spoken by Campbell Scientific
//! CR1000-family dataloggers over serial or TCP byte streams.
//!
//! PakBus frames are delimited by `0xBD` bytes, escape-quoted, and
//! carry a running 16-bit signature; a two-byte nullifier appended to
//! each packet drives the receiver's signature to zero, so corrupt
//! frames are cheap to detect and drop. On top of the framing ride two
//! higher-level protocols: PakCtrl (hello/bye/settings) and BMP5
//! (clock, files, table definitions, data collection), both
//! transaction-oriented.
//! This crate implements the framing, the typed binary codec, the
//! transaction dispatch and the command round-trips, and decodes
//! collected data into typed records using the table schema the
//! logger itself serves.
//!
//! The entry point is [`Datalogger`](Datalogger):
//!
//! ```no_run
//! use std::time::Duration;
//! use pakbus::{Datalogger, DeviceOptions};
//!
//! # fn main() -> pakbus::Result<()> {
//! let mut logger = Datalogger::from_url(
//!     "tcp:192.168.0.21:6785",
//!     Duration::from_secs(10),
//!     DeviceOptions::default(),
//! )?;
//! println!("device clock: {}", logger.get_time()?);
//! for batch in logger.collect("Table1", None, None)? {
//!     for record in batch? {
//!         println!("{} #{}", record.time, record.rec_nbr);
//!     }
//! }
//! logger.bye()?;
//! # Ok(())
//! # }
//! ```
//!
//! Anything implementing [`Link`](Link) can carry the protocol; TCP
//! and serial implementations are built in.

#[deny(rustdoc::broken_intra_doc_links)]
pub mod collect;
pub mod device;
pub mod error;
pub mod frame;
pub mod header;
pub mod link;
pub mod message;
pub mod tabledef;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testlink;

pub use collect::{Fragment, FragmentData, Record};
pub use device::{Collect, Datalogger, DeviceOptions};
pub use error::{Error, Result};
#[cfg(feature = "serial")]
pub use link::SerialLink;
pub use link::{link_from_url, Link, TcpLink};
pub use message::{CollectMode, ProgStats, Setting};
pub use tabledef::{FieldDef, TableDef};
pub use transport::PakBus;
pub use types::{DataType, NSec, Value};
