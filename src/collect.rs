//! Decoding of collect-data record payloads.
//!
//! The raw `RecData` of a collect-data response is a sequence of
//! record fragments. Their layout is not self-describing: field names,
//! types and dimensions come from the cached table definitions, so the
//! same bytes can only be interpreted against the `.TDF` the logger
//! served earlier.

use chrono::NaiveDateTime;
use log::debug;

use crate::error::{Error, Result};
use crate::tabledef::TableDef;
use crate::types::{DataType, NSec, Reader, Value, PAKBUS_EPOCH};

/// One stored record, reconstructed against the table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Timestamp of the record.
    pub time: NaiveDateTime,

    /// Record number within the table.
    pub rec_nbr: u32,

    /// Field values in declaration order.
    pub fields: Vec<(String, Value)>,
}

impl Record {
    /// Looks a field up by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// Payload of one record fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentData {
    /// Complete records.
    Records(Vec<Record>),

    /// Part of a record too large for one response. Not reassembled;
    /// surfaced as raw bytes together with the byte offset the logger
    /// reported.
    Partial { byte_offset: u32, raw: Vec<u8> },
}

/// One record fragment of a collect-data response.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub table_nbr: u16,
    pub table_name: String,
    /// Record number of the first record in the fragment.
    pub beg_rec_nbr: u32,
    pub data: FragmentData,
}

/// Decodes the `RecData` payload of a collect-data response.
///
/// Returns the fragments and the trailing flag that tells whether the
/// logger holds more records beyond this response.
pub fn parse_collect_data(raw: &[u8], tables: &[TableDef]) -> Result<(Vec<Fragment>, bool)> {
    if raw.is_empty() {
        return Ok((Vec::new(), false));
    }

    let mut rd = Reader::new(raw);
    let mut fragments = Vec::new();

    while rd.remaining() > 1 {
        let table_nbr = rd.pop_u16_be()?;
        let beg_rec_nbr = rd.pop_u32_be()?;

        let table = table_nbr
            .checked_sub(1)
            .and_then(|i| tables.get(usize::from(i)))
            .ok_or_else(|| {
                Error::BadData(format!("record fragment for unknown table {}", table_nbr))
            })?;

        let data = if rd.peek_u8()? & 0x80 != 0 {
            // A fragmented record: a byte offset instead of a record
            // count, everything up to the more-flag is raw payload.
            let byte_offset = rd.pop_u32_be()? & 0x7FFF_FFFF;
            let len = rd
                .remaining()
                .checked_sub(1)
                .ok_or_else(|| Error::BadData("record fragment missing its more flag".into()))?;
            let raw = rd.pop_bytes(len)?;
            debug!(
                "partial record for table {:?} at byte offset {}",
                table.name, byte_offset
            );
            FragmentData::Partial { byte_offset, raw }
        } else {
            let nbr_of_recs = rd.pop_u16_be()? & 0x7FFF;

            // Interval tables stamp only the first record; event-driven
            // tables stamp every record individually.
            let first_time = if table.is_event_driven() {
                None
            } else {
                Some(rd.pop_nsec()?)
            };

            let mut records = Vec::with_capacity(usize::from(nbr_of_recs));
            for n in 0..u32::from(nbr_of_recs) {
                let time = match first_time {
                    Some(t0) => interval_time(t0, table.interval, n),
                    None => rd.pop_nsec()?.to_datetime(),
                }
                .ok_or_else(|| Error::BadData("record timestamp out of range".into()))?;

                let mut fields = Vec::with_capacity(table.fields.len());
                for field in &table.fields {
                    fields.push((field.name.clone(), decode_field(&mut rd, field)?));
                }
                records.push(Record {
                    time,
                    rec_nbr: beg_rec_nbr.wrapping_add(n),
                    fields,
                });
            }
            FragmentData::Records(records)
        };

        fragments.push(Fragment {
            table_nbr,
            table_name: table.name.clone(),
            beg_rec_nbr,
            data,
        });
    }

    let more = rd.pop_u8()? != 0;
    Ok((fragments, more))
}

/// Timestamp of record `n` of an interval-driven fragment.
fn interval_time(t0: NSec, interval: NSec, n: u32) -> Option<NaiveDateTime> {
    let n = i64::from(n);
    let nanos = i64::from(t0.nsec) + n * i64::from(interval.nsec);
    let secs = PAKBUS_EPOCH + i64::from(t0.sec) + n * i64::from(interval.sec) + nanos.div_euclid(1_000_000_000);
    chrono::DateTime::from_timestamp(secs, 0).map(|t| t.naive_utc())
}

/// Decodes one field of a record. `ASCII` fields occupy exactly
/// `dimension` bytes; any other type occupies `dimension` consecutive
/// values of which only the first is retained, unless the `arrays`
/// feature keeps them all.
fn decode_field(rd: &mut Reader, field: &crate::tabledef::FieldDef) -> Result<Value> {
    if field.data_type == DataType::ASCII {
        return rd.pop_value(DataType::ASCII, field.dimension as usize);
    }
    if field.dimension == 0 {
        return Err(Error::BadData(format!(
            "field {:?} has dimension zero",
            field.name
        )));
    }

    let mut values = Vec::with_capacity(field.dimension as usize);
    for _ in 0..field.dimension {
        values.push(rd.pop_value(field.data_type, 1)?);
    }
    if values.len() == 1 {
        return Ok(values.swap_remove(0));
    }
    if cfg!(feature = "arrays") {
        Ok(Value::Array(values))
    } else {
        Ok(values.swap_remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabledef::{fixtures, parse_tabledefs};
    use crate::types::Writer;

    fn tables() -> Vec<TableDef> {
        parse_tabledefs(&fixtures::tdf()).unwrap()
    }

    /// Three interval records for `Table1`, starting at record 89052,
    /// first stamped 2012-07-26 13:40:00.
    fn interval_payload(more: bool) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u16_be(1) // Table1
            .put_u32_be(89_052)
            .put_u16_be(3)
            .put_nsec(NSec::new(712_158_000, 0));
        for (fp2, temp) in [(0x4551u16, 24.5f32), (0x4552, 24.25), (0x4553, 24.0)] {
            w.put_u16_be(fp2);
            for b in temp.to_be_bytes().iter() {
                w.put_u8(*b);
            }
            w.put_ascii("LAB0");
        }
        w.put_u8(more as u8);
        w.into_bytes()
    }

    #[test]
    fn decodes_interval_records() {
        let (frags, more) = parse_collect_data(&interval_payload(false), &tables()).unwrap();
        assert!(!more);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].table_name, "Table1");
        assert_eq!(frags[0].beg_rec_nbr, 89_052);

        let records = match &frags[0].data {
            FragmentData::Records(r) => r,
            other => panic!("unexpected fragment {:?}", other),
        };
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].rec_nbr, 89_052);
        assert_eq!(records[2].rec_nbr, 89_054);

        // one timestamp, spaced by the five-second interval
        assert_eq!(records[0].time.to_string(), "2012-07-26 13:40:00");
        assert_eq!(records[1].time.to_string(), "2012-07-26 13:40:05");
        assert_eq!(records[2].time.to_string(), "2012-07-26 13:40:10");

        match records[0].field("Batt_Volt_Avg") {
            Some(Value::F32(v)) => assert!((v - 13.61).abs() < 1e-4),
            other => panic!("unexpected value {:?}", other),
        }
        assert_eq!(records[1].field("Panel_Temp_Avg"), Some(&Value::F32(24.25)));
        assert_eq!(
            records[0].field("Station"),
            Some(&Value::Str("LAB0".into()))
        );
    }

    #[test]
    fn decodes_event_records_with_individual_timestamps() {
        let mut w = Writer::new();
        w.put_u16_be(2) // Events
            .put_u32_be(7)
            .put_u16_be(2);
        w.put_nsec(NSec::new(100, 0)).put_u32_be(11).put_u32_be(12);
        w.put_nsec(NSec::new(250, 0)).put_u32_be(13).put_u32_be(14);
        w.put_u8(0);

        let (frags, more) = parse_collect_data(&w.into_bytes(), &tables()).unwrap();
        assert!(!more);
        let records = match &frags[0].data {
            FragmentData::Records(r) => r,
            other => panic!("unexpected fragment {:?}", other),
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time.to_string(), "1990-01-01 00:01:40");
        assert_eq!(records[1].time.to_string(), "1990-01-01 00:04:10");
        // Counts has dimension two; the first element is retained
        if cfg!(feature = "arrays") {
            assert_eq!(
                records[0].field("Counts"),
                Some(&Value::Array(vec![Value::U32(11), Value::U32(12)]))
            );
        } else {
            assert_eq!(records[0].field("Counts"), Some(&Value::U32(11)));
            assert_eq!(records[1].field("Counts"), Some(&Value::U32(13)));
        }
    }

    #[test]
    fn surfaces_partial_records_raw() {
        let mut w = Writer::new();
        w.put_u16_be(1)
            .put_u32_be(500)
            .put_u32_be(0x8000_0400); // offset flag + byte offset 1024
        w.put_u8(0xAA).put_u8(0xBB).put_u8(0xCC);
        w.put_u8(1); // more

        let (frags, more) = parse_collect_data(&w.into_bytes(), &tables()).unwrap();
        assert!(more);
        match &frags[0].data {
            FragmentData::Partial { byte_offset, raw } => {
                assert_eq!(*byte_offset, 1024);
                assert_eq!(raw, &[0xAA, 0xBB, 0xCC]);
            }
            other => panic!("unexpected fragment {:?}", other),
        }
    }

    #[test]
    fn more_flag_is_reported() {
        let (_, more) = parse_collect_data(&interval_payload(true), &tables()).unwrap();
        assert!(more);
    }

    #[test]
    fn empty_payload_means_no_records() {
        let (frags, more) = parse_collect_data(&[], &tables()).unwrap();
        assert!(frags.is_empty());
        assert!(!more);
    }

    #[test]
    fn unknown_table_number_is_an_error() {
        let mut w = Writer::new();
        w.put_u16_be(9).put_u32_be(1).put_u16_be(0).put_u8(0);
        assert!(parse_collect_data(&w.into_bytes(), &tables()).is_err());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let payload = interval_payload(false);
        assert!(parse_collect_data(&payload[..payload.len() - 4], &tables()).is_err());
    }
}
