//! Low-level framing of PakBus packets.
//!
//! On the wire a packet travels as
//!
//! ```text
//! 0xBD  quote(packet + nullifier(packet))  0xBD
//! ```
//!
//! where the two nullifier bytes are chosen so that the running
//! signature of the unquoted region comes out zero. A receiver can
//! therefore validate any frame by running the signature over it and
//! checking for zero.

use std::io;
use std::time::Instant;

use log::{debug, warn};

use crate::error::Result;
use crate::link::Link;

/// Frame delimiter; reserved on the wire.
const FRAME_SYNC: u8 = 0xBD;
/// Escape prefix; reserved on the wire.
const FRAME_QUOTE: u8 = 0xBC;
/// Second byte of an escaped 0xBC.
const QUOTED_QUOTE: u8 = 0xDC;
/// Second byte of an escaped 0xBD.
const QUOTED_SYNC: u8 = 0xDD;

/// Seed of the running signature.
pub const SIG_SEED: u16 = 0xAAAA;

/// Computes the 16-bit running signature of `buf`, starting from
/// `seed`. A whole frame (packet plus nullifier) has signature zero.
pub fn signature(seed: u16, buf: &[u8]) -> u16 {
    let mut sig = u32::from(seed);
    for &x in buf {
        let j = sig;
        sig = (sig << 1) & 0x1FF;
        if sig >= 0x100 {
            sig += 1;
        }
        sig = ((sig + (j >> 8) + u32::from(x)) & 0xFF) | ((j << 8) & 0xFF00);
    }
    sig as u16
}

/// Computes the two bytes that drive a running signature of `sig` down
/// to zero when appended to the packet.
pub fn nullifier(sig: u16) -> [u8; 2] {
    let mut out = [0u8; 2];
    let mut sig = sig;
    let mut last: Option<u8> = None;
    for slot in out.iter_mut() {
        if let Some(b) = last {
            sig = signature(sig, &[b]);
        }
        let mut rot = (u32::from(sig) << 1) & 0x1FF;
        if rot >= 0x100 {
            rot += 1;
        }
        let b = ((0x100i32 - (rot as i32 + (i32::from(sig) >> 8))) & 0xFF) as u8;
        *slot = b;
        last = Some(b);
    }
    out
}

/// Escapes the reserved bytes of `packet`.
pub fn quote(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + 2);
    for &b in packet {
        match b {
            FRAME_QUOTE => out.extend_from_slice(&[FRAME_QUOTE, QUOTED_QUOTE]),
            FRAME_SYNC => out.extend_from_slice(&[FRAME_QUOTE, QUOTED_SYNC]),
            b => out.push(b),
        }
    }
    out
}

/// Reverses [`quote`](quote). Unknown escape pairs and a trailing
/// escape byte are passed through untouched; the signature check
/// rejects such frames.
pub fn unquote(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len());
    let mut iter = frame.iter().peekable();
    while let Some(&b) = iter.next() {
        if b != FRAME_QUOTE {
            out.push(b);
            continue;
        }
        match iter.peek() {
            Some(&&QUOTED_QUOTE) => {
                iter.next();
                out.push(FRAME_QUOTE);
            }
            Some(&&QUOTED_SYNC) => {
                iter.next();
                out.push(FRAME_SYNC);
            }
            _ => out.push(b),
        }
    }
    out
}

/// Formats bytes the way wire dumps are logged.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Signs, quotes and writes one packet.
pub fn send_frame<L: Link>(link: &mut L, packet: &[u8]) -> Result<()> {
    let sig = signature(SIG_SEED, packet);
    let null = nullifier(sig);
    let mut body = packet.to_vec();
    body.extend_from_slice(&null);

    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(FRAME_SYNC);
    frame.extend(quote(&body));
    frame.push(FRAME_SYNC);
    debug!("write: {}", hex(&frame));
    link.write_all(&frame)?;
    Ok(())
}

/// Reads one packet, or `None` if no complete valid frame arrives
/// before the link timeout.
///
/// Leading garbage is skipped, a run of delimiters counts as a single
/// frame start, and frames whose signature does not come out zero are
/// dropped as if nothing had been received.
pub fn recv_frame<L: Link>(link: &mut L) -> Result<Option<Vec<u8>>> {
    let deadline = Instant::now() + link.timeout();

    // Skip until the first delimiter.
    loop {
        match read_byte(link)? {
            Some(FRAME_SYNC) => break,
            Some(_) => continue,
            None if Instant::now() >= deadline => return Ok(None),
            None => continue,
        }
    }

    // Skip the delimiter run, then accumulate until the closing
    // delimiter.
    let mut escaped = Vec::new();
    loop {
        match read_byte(link)? {
            Some(FRAME_SYNC) if escaped.is_empty() => continue,
            Some(FRAME_SYNC) => break,
            Some(b) => escaped.push(b),
            None if Instant::now() >= deadline => return Ok(None),
            None => continue,
        }
    }
    debug!("read: {}", hex(&escaped));

    let mut packet = unquote(&escaped);
    if signature(SIG_SEED, &packet) != 0 {
        warn!("dropping frame with bad signature: {}", hex(&packet));
        return Ok(None);
    }
    match packet.len().checked_sub(2) {
        Some(len) => {
            // Strip the signature nullifier.
            packet.truncate(len);
            Ok(Some(packet))
        }
        None => Ok(None),
    }
}

fn read_byte<L: Link>(link: &mut L) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match link.read(&mut byte) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::TimedOut
                || e.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlink::{from_hex, TestLink};

    #[test]
    fn quote_unquote_round_trip() {
        let packet = [0x00, 0xBC, 0x01, 0xBD, 0xBC, 0xBD, 0xFF];
        let quoted = quote(&packet);
        assert!(!quoted.contains(&0xBD));
        assert_eq!(unquote(&quoted), packet);
    }

    #[test]
    fn unquote_leading_escape() {
        // An escaped delimiter at the start of a frame
        assert_eq!(unquote(&[0xBC, 0xDD, 0x01]), [0xBD, 0x01]);
    }

    #[test]
    fn known_signature_is_zero() {
        let packet = from_hex("A8 02 10 01 18 02 00 01 9D 05 0D 00 00 00 6C 8E 14");
        assert_eq!(signature(SIG_SEED, &packet), 0);
    }

    #[test]
    fn corrupted_signature_and_nullifier() {
        let mut packet = from_hex("A8 02 10 01 18 02 00 01 9D 05 0D 00 00 00 6C 8E 14");
        packet[0] = 0xD7;
        let sig = signature(SIG_SEED, &packet);
        assert_ne!(sig, 0);
        assert_eq!(&nullifier(sig), b"2h");
    }

    #[test]
    fn nullifier_zeroes_any_packet() {
        let hello = from_hex("90 01 58 02 00 01 08 02 09 01 00 02 07 08");
        for packet in [&hello[..], b"", b"\xBD\xBC", &[0u8; 64]].iter() {
            let mut framed = packet.to_vec();
            framed.extend_from_slice(&nullifier(signature(SIG_SEED, packet)));
            assert_eq!(signature(SIG_SEED, &framed), 0);
        }
    }

    #[test]
    fn signature_seed_matters() {
        let hello = from_hex("90 01 58 02 00 01 08 02 09 01 00 02 07 08");
        let mut framed = hello.clone();
        framed.extend_from_slice(&nullifier(signature(SIG_SEED, &hello)));
        assert_eq!(signature(SIG_SEED, &framed), 0);
        for seed in [0x0000, 0xFFFF, 0xAAAB] {
            assert_ne!(signature(seed, &framed), 0);
        }
    }

    #[test]
    fn send_then_recv_round_trip() {
        let packet = from_hex("A0 01 98 02 00 01 08 02 0F 02");
        let mut link = TestLink::new(&[]);
        send_frame(&mut link, &packet).unwrap();
        assert_eq!(link.sent[0], 0xBD);
        assert_eq!(*link.sent.last().unwrap(), 0xBD);

        let sent = link.sent.clone();
        let mut link = TestLink::new(&sent);
        assert_eq!(recv_frame(&mut link).unwrap().unwrap(), packet);
    }

    #[test]
    fn recv_skips_garbage_and_delimiter_runs() {
        let packet = [0xBC, 0xBD, 0x42];
        let mut out = TestLink::new(&[]);
        send_frame(&mut out, &packet).unwrap();

        let mut wire = vec![0x13, 0x37, 0xBD, 0xBD, 0xBD];
        wire.extend_from_slice(&out.sent[1..]);
        let mut link = TestLink::new(&wire);
        assert_eq!(recv_frame(&mut link).unwrap().unwrap(), packet);
    }

    #[test]
    fn recv_drops_bad_signature() {
        let mut out = TestLink::new(&[]);
        send_frame(&mut out, &[0x01, 0x02, 0x03]).unwrap();
        let mut wire = out.sent.clone();
        // flip a packet byte without touching the delimiters
        wire[2] ^= 0xFF;
        let mut link = TestLink::new(&wire);
        assert!(recv_frame(&mut link).unwrap().is_none());
    }

    #[test]
    fn recv_times_out_without_delimiter() {
        let mut link = TestLink::new(&[0x01, 0x02, 0x03]);
        assert!(recv_frame(&mut link).unwrap().is_none());
    }
}
