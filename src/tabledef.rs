//! Parsers for the two special files a datalogger serves over file
//! upload: the `.DIR` file directory and the `.TDF` table definitions.

use bitmatch::bitmatch;
use log::debug;

use crate::error::{Error, Result};
use crate::frame;
use crate::types::{DataType, NSec, Reader};

/// One entry of the `.DIR` file directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileEntry {
    pub name: String,
    pub size: u32,
    /// Timestamp string as the logger formats it.
    pub last_update: String,
    pub attributes: Vec<u8>,
}

/// A parsed `.DIR` file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Directory {
    pub version: u8,
    pub files: Vec<FileEntry>,
}

/// Parses a `.DIR` directory listing. An entry with an empty file name
/// terminates the listing; each entry carries up to twelve attribute
/// bytes ended by a zero.
pub fn parse_directory(data: &[u8]) -> Result<Directory> {
    let mut rd = Reader::new(data);
    let version = rd.pop_u8()?;

    let mut files = Vec::new();
    while !rd.is_empty() {
        let name = rd.pop_asciiz()?;
        if name.is_empty() {
            break;
        }
        let size = rd.pop_u32_be()?;
        let last_update = rd.pop_asciiz()?;
        let mut attributes = Vec::new();
        for _ in 0..12 {
            let attribute = rd.pop_u8()?;
            if attribute == 0 {
                break;
            }
            attributes.push(attribute);
        }
        files.push(FileEntry {
            name,
            size,
            last_update,
            attributes,
        });
    }
    Ok(Directory { version, files })
}

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldDef {
    pub read_only: bool,
    pub data_type: DataType,
    pub name: String,
    pub aliases: Vec<String>,
    pub processing: String,
    pub units: String,
    pub description: String,
    pub beg_idx: u32,
    /// Number of elements; for `ASCII` fields the number of bytes.
    pub dimension: u32,
    pub sub_dims: Vec<u32>,
}

/// One table of a `.TDF` table definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableDef {
    pub name: String,
    pub size: u32,
    pub time_type: u8,
    pub time_into: NSec,
    /// Sampling cadence. All zeroes for an event-driven table, in
    /// which case every stored record carries its own timestamp.
    pub interval: NSec,
    pub fields: Vec<FieldDef>,
    /// Signature of the table's definition bytes; collect-data
    /// commands quote it so the logger can detect a stale schema.
    pub signature: u16,
}

impl TableDef {
    /// Whether records carry individual timestamps instead of being
    /// spaced by [`interval`](Self::interval).
    pub fn is_event_driven(&self) -> bool {
        self.interval == NSec::default()
    }
}

/// Parses a `.TDF` file into its list of table definitions.
///
/// Table numbers used by collect-data commands are 1-based indices
/// into the returned list.
#[bitmatch]
pub fn parse_tabledefs(data: &[u8]) -> Result<Vec<TableDef>> {
    let mut rd = Reader::new(data);
    let fsl_version = rd.pop_u8()?;
    debug!("table definitions, fsl version {}", fsl_version);

    let mut tables = Vec::new();
    while !rd.is_empty() {
        let start = rd.pos();

        let name = rd.pop_asciiz()?;
        let size = rd.pop_u32_be()?;
        let time_type = rd.pop_u8()?;
        let time_into = rd.pop_nsec()?;
        let interval = rd.pop_nsec()?;

        let mut fields = Vec::new();
        loop {
            let field_type = rd.pop_u8()?;
            if field_type == 0 {
                break;
            }
            #[bitmatch]
            let "rttt_tttt" = field_type;
            let data_type = DataType::from_code(t).ok_or_else(|| {
                Error::BadData(format!(
                    "unknown field type code {} in table {:?}",
                    t, name
                ))
            })?;

            let field_name = rd.pop_asciiz()?;
            let mut aliases = Vec::new();
            loop {
                let alias = rd.pop_asciiz()?;
                if alias.is_empty() {
                    break;
                }
                aliases.push(alias);
            }
            let processing = rd.pop_asciiz()?;
            let units = rd.pop_asciiz()?;
            let description = rd.pop_asciiz()?;
            let beg_idx = rd.pop_u32_be()?;
            let dimension = rd.pop_u32_be()?;
            let mut sub_dims = Vec::new();
            loop {
                let sub_dim = rd.pop_u32_be()?;
                if sub_dim == 0 {
                    break;
                }
                sub_dims.push(sub_dim);
            }

            fields.push(FieldDef {
                read_only: r != 0,
                data_type,
                name: field_name,
                aliases,
                processing,
                units,
                description,
                beg_idx,
                dimension,
                sub_dims,
            });
        }

        // The table's signature covers its definition bytes up to and
        // including the field list terminator.
        let signature = frame::signature(frame::SIG_SEED, &data[start..rd.pos()]);

        tables.push(TableDef {
            name,
            size,
            time_type,
            time_into,
            interval,
            fields,
            signature,
        });
    }
    Ok(tables)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::types::Writer;

    /// Appends one field definition in `.TDF` layout.
    pub fn push_field(w: &mut Writer, type_code: u8, read_only: bool, name: &str, units: &str, dimension: u32) {
        w.put_u8(type_code | if read_only { 0x80 } else { 0x00 })
            .put_asciiz(name)
            .put_asciiz("") // alias list terminator
            .put_asciiz("Avg") // processing
            .put_asciiz(units)
            .put_asciiz("") // description
            .put_u32_be(1) // begin index
            .put_u32_be(dimension)
            .put_u32_be(0); // sub-dimension list terminator
    }

    /// An interval-driven table of one FP2, one IEEE4B and one 4-byte
    /// ASCII column, sampling every five seconds.
    pub fn interval_table(name: &str) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_asciiz(name)
            .put_u32_be(1000)
            .put_u8(0x0E)
            .put_nsec(crate::types::NSec::default())
            .put_nsec(crate::types::NSec::new(5, 0));
        push_field(&mut w, 7, true, "Batt_Volt_Avg", "Volts", 1);
        push_field(&mut w, 9, true, "Panel_Temp_Avg", "DegC", 1);
        push_field(&mut w, 11, false, "Station", "", 4);
        w.put_u8(0); // field list terminator
        w.into_bytes()
    }

    /// An event-driven table (all-zero interval) of a single UInt4
    /// column with two elements.
    pub fn event_table(name: &str) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_asciiz(name)
            .put_u32_be(50)
            .put_u8(0x0E)
            .put_nsec(crate::types::NSec::default())
            .put_nsec(crate::types::NSec::default());
        push_field(&mut w, 3, false, "Counts", "", 2);
        w.put_u8(0);
        w.into_bytes()
    }

    /// A complete `.TDF` image holding both tables above, named
    /// `Table1` and `Events`.
    pub fn tdf() -> Vec<u8> {
        let mut data = vec![0x01]; // fsl version
        data.extend(interval_table("Table1"));
        data.extend(event_table("Events"));
        data
    }
}
