//! The PakBus transport: command packets, transaction numbers and the
//! response wait loop.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::frame;
use crate::header::{self, Header, HEADER_LEN};
use crate::link::Link;
use crate::message::{self, CollectMode, Message};
use crate::types::{NSec, Writer};

/// Default node id of an adjacent datalogger.
pub const DEST_NODE: u16 = 0x001;
/// Default node id this client claims for itself.
pub const SRC_NODE: u16 = 0x802;
/// Default security code (none configured).
pub const SECURITY_CODE: u16 = 0x0000;

/// Bytes a file-upload command asks for per chunk.
pub const FILE_SWATH: u16 = 0x0200;

/// A PakBus node talking to one adjacent peer over a [`Link`](Link).
///
/// Owns the 8-bit transaction counter that correlates commands with
/// their responses. The counter wraps and is never reset; stale
/// transaction numbers are harmless because the wait loop only accepts
/// the number it was asked for.
pub struct PakBus<L: Link> {
    link: L,
    src_node: u16,
    dest_node: u16,
    security_code: u16,
    tran: u8,
    greeted: bool,
}

impl<L: Link> PakBus<L> {
    pub fn new(link: L, dest_node: u16, src_node: u16, security_code: u16) -> Self {
        PakBus {
            link,
            src_node,
            dest_node,
            security_code,
            tran: 0,
            greeted: false,
        }
    }

    /// The underlying link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn next_tran(&mut self) -> u8 {
        self.tran = self.tran.wrapping_add(1);
        self.tran
    }

    /// Sends one packet. The first packet of a session is preceded by
    /// a run of delimiter bytes to get the node's attention.
    pub fn send(&mut self, packet: &[u8]) -> Result<()> {
        if !self.greeted {
            info!("getting the node's attention");
            self.link.write_all(&[0xBD; 6])?;
            self.greeted = true;
        }
        frame::send_frame(&mut self.link, packet)
    }

    /// Receives one packet and decodes it, or `None` when nothing
    /// valid arrives within the link timeout.
    pub fn recv(&mut self) -> Result<Option<(Header, Message)>> {
        let packet = match frame::recv_frame(&mut self.link)? {
            Some(packet) => packet,
            None => return Ok(None),
        };
        let hdr = match Header::from_bytes(&packet) {
            Ok(hdr) => hdr,
            Err(e) => {
                debug!("dropping malformed packet: {}", e);
                return Ok(None);
            }
        };
        match Message::parse(hdr.hi_proto, &packet[HEADER_LEN..]) {
            Ok(msg) => Ok(Some((hdr, msg))),
            Err(e) => {
                debug!("dropping undecodable packet: {}", e);
                Ok(None)
            }
        }
    }

    /// Waits for the response to transaction `tran`.
    ///
    /// Stray traffic is dropped, incoming hello probes are answered,
    /// please-wait notifications stretch the wait, and a delivery
    /// failure aborts it. `None` means nothing matching arrived within
    /// the link timeout.
    pub fn wait_for(&mut self, tran: u8) -> Result<Option<(Header, Message)>> {
        debug!("waiting for transaction {}", tran);
        loop {
            let (hdr, msg) = match self.recv()? {
                Some(pair) => pair,
                None => return Ok(None),
            };

            // Not addressed to us at all.
            if hdr.dst_node != self.src_node
                || hdr.dst_phy != self.src_node
                || hdr.src_node != self.dest_node
                || hdr.src_phy != self.dest_node
            {
                debug!(
                    "ignoring traffic for node {:#05x} from {:#05x}",
                    hdr.dst_node, hdr.src_node
                );
                continue;
            }

            match msg {
                Message::HelloCmd(hello) => {
                    info!("answering hello probe from node {:#05x}", hdr.src_node);
                    let packet = self.hello_response(hello.tran_nbr);
                    self.send(&packet)?;
                }
                Message::Failure { code, .. } => return Err(Error::DeliveryFailure(code)),
                Message::PleaseWait {
                    tran_nbr,
                    wait_secs,
                    ..
                } if tran_nbr == tran => {
                    info!("node asked us to wait {} s", wait_secs);
                    thread::sleep(Duration::from_secs(u64::from(wait_secs)));
                }
                msg if msg.tran_nbr() == tran => return Ok(Some((hdr, msg))),
                msg => {
                    debug!(
                        "dropping response for stale transaction {}",
                        msg.tran_nbr()
                    );
                }
            }
        }
    }

    /// Sends a command and waits for its response, measuring the
    /// estimated one-way transit time as half the round trip.
    pub fn send_wait(
        &mut self,
        packet: &[u8],
        tran: u8,
    ) -> Result<Option<(Header, Message, Duration)>> {
        let begin = Instant::now();
        self.send(packet)?;
        let response = self.wait_for(tran)?;
        let transit = Duration::from_secs((begin.elapsed() / 2).as_secs());
        Ok(response.map(|(hdr, msg)| (hdr, msg, transit)))
    }

    fn command(&self, hi_proto: u8, exp_more: u8, link_state: u8) -> Writer {
        let mut w = Writer::new();
        let hdr = Header::new(hi_proto, exp_more, link_state, self.dest_node, self.src_node);
        for b in hdr.to_bytes().iter() {
            w.put_u8(*b);
        }
        w
    }

    /// Hello command, ringing the peer.
    pub fn hello_cmd(&mut self) -> (Vec<u8>, u8) {
        let tran = self.next_tran();
        let mut w = self.command(header::PAKCTRL, 0x1, header::RING);
        w.put_u8(message::HELLO_CMD)
            .put_u8(tran)
            .put_u8(0x00) // not a router
            .put_u8(0x02) // hop metric
            .put_u16_be(1800); // verify interval
        (w.into_bytes(), tran)
    }

    /// Response to an incoming hello probe.
    pub fn hello_response(&self, tran: u8) -> Vec<u8> {
        let mut w = self.command(header::PAKCTRL, 0x2, header::READY);
        w.put_u8(message::HELLO_RESPONSE)
            .put_u8(tran)
            .put_u8(0x00)
            .put_u8(0x02)
            .put_u16_be(1800);
        w.into_bytes()
    }

    /// Get-settings command.
    pub fn getsettings_cmd(&mut self) -> (Vec<u8>, u8) {
        let tran = self.next_tran();
        let mut w = self.command(header::PAKCTRL, 0x2, header::READY);
        w.put_u8(message::GETSETTINGS_CMD).put_u8(tran);
        (w.into_bytes(), tran)
    }

    /// Clock command. A zero adjustment reads the clock, anything else
    /// slews it.
    pub fn clock_cmd(&mut self, adjustment: NSec) -> (Vec<u8>, u8) {
        let tran = self.next_tran();
        let mut w = self.command(header::BMP5, 0x2, header::READY);
        w.put_u8(message::CLOCK_CMD)
            .put_u8(tran)
            .put_u16_be(self.security_code)
            .put_nsec(adjustment);
        (w.into_bytes(), tran)
    }

    /// Get-programming-statistics command.
    pub fn getprogstat_cmd(&mut self) -> (Vec<u8>, u8) {
        let tran = self.next_tran();
        let mut w = self.command(header::BMP5, 0x2, header::READY);
        w.put_u8(message::GETPROGSTAT_CMD)
            .put_u8(tran)
            .put_u16_be(self.security_code);
        (w.into_bytes(), tran)
    }

    /// File-upload command for one chunk of `filename`.
    ///
    /// Continuation chunks of the same file must reuse the transaction
    /// number of the first chunk; pass it as `tran`.
    pub fn fileupload_cmd(
        &mut self,
        filename: &str,
        offset: u32,
        swath: u16,
        close: bool,
        tran: Option<u8>,
    ) -> (Vec<u8>, u8) {
        let tran = tran.unwrap_or_else(|| self.next_tran());
        let mut w = self.command(header::BMP5, 0x2, header::READY);
        w.put_u8(message::FILEUPLOAD_CMD)
            .put_u8(tran)
            .put_u16_be(self.security_code)
            .put_asciiz(filename)
            .put_u8(close as u8)
            .put_u32_be(offset)
            .put_u16_be(swath);
        (w.into_bytes(), tran)
    }

    /// Collect-data command against a table whose definition signature
    /// is `tabledef_sig`.
    pub fn collectdata_cmd(
        &mut self,
        table_nbr: u16,
        tabledef_sig: u16,
        mode: CollectMode,
    ) -> (Vec<u8>, u8) {
        let tran = self.next_tran();
        let mut w = self.command(header::BMP5, 0x2, header::READY);
        w.put_u8(message::COLLECTDATA_CMD)
            .put_u8(tran)
            .put_u16_be(self.security_code)
            .put_u8(mode.code())
            .put_u16_be(table_nbr)
            .put_u16_be(tabledef_sig);
        mode.encode_params(&mut w);
        w.put_u16_be(0); // field list: all fields
        (w.into_bytes(), tran)
    }

    /// Bye command. Carries no live transaction number; the peer does
    /// not answer it.
    pub fn bye_cmd(&mut self) -> (Vec<u8>, u8) {
        let tran = self.next_tran();
        let mut w = self.command(header::PAKCTRL, 0x0, header::FINISHED);
        w.put_u8(message::BYE_CMD).put_u8(0x0);
        (w.into_bytes(), tran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlink::{from_hex, TestLink};

    fn bus(link: TestLink) -> PakBus<TestLink> {
        PakBus::new(link, DEST_NODE, SRC_NODE, SECURITY_CODE)
    }

    /// A transport with swapped addresses, standing in for the logger.
    fn peer(link: TestLink) -> PakBus<TestLink> {
        PakBus::new(link, SRC_NODE, DEST_NODE, SECURITY_CODE)
    }

    fn hex(bytes: &[u8]) -> String {
        crate::frame::hex(bytes)
    }

    #[test]
    fn command_packets_match_known_frames() {
        let mut bus = bus(TestLink::new(&[]));

        let (hello, tran) = bus.hello_cmd();
        assert_eq!(tran, 1);
        assert_eq!(hex(&hello), "90 01 58 02 00 01 08 02 09 01 00 02 07 08");

        let (settings, tran) = bus.getsettings_cmd();
        assert_eq!(tran, 2);
        assert_eq!(hex(&settings), "A0 01 98 02 00 01 08 02 0F 02");

        let (collect, tran) = bus.collectdata_cmd(
            2,
            40615,
            CollectMode::TimeRange(NSec::new(712_142_640, 0), NSec::new(712_142_644, 0)),
        );
        assert_eq!(tran, 3);
        assert_eq!(
            hex(&collect),
            "A0 01 98 02 10 01 08 02 09 03 00 00 07 00 02 9E A7 2A 72 6F 30 00 00 00 00 2A 72 6F 34 00 00 00 00 00 00"
        );

        let (clock, tran) = bus.clock_cmd(NSec::default());
        assert_eq!(tran, 4);
        assert_eq!(
            hex(&clock),
            "A0 01 98 02 10 01 08 02 17 04 00 00 00 00 00 00 00 00 00 00"
        );

        let (progstat, tran) = bus.getprogstat_cmd();
        assert_eq!(tran, 5);
        assert_eq!(hex(&progstat), "A0 01 98 02 10 01 08 02 18 05 00 00");

        let (upload, tran) = bus.fileupload_cmd("Filename", 0, FILE_SWATH, true, None);
        assert_eq!(tran, 6);
        assert_eq!(
            hex(&upload),
            "A0 01 98 02 10 01 08 02 1D 06 00 00 46 69 6C 65 6E 61 6D 65 00 01 00 00 00 00 02 00"
        );

        let (bye, _) = bus.bye_cmd();
        assert_eq!(hex(&bye), "B0 01 18 02 00 01 08 02 0D 00");
    }

    #[test]
    fn hello_response_matches_known_frame() {
        let bus = bus(TestLink::new(&[]));
        assert_eq!(
            hex(&bus.hello_response(1)),
            "A0 01 98 02 00 01 08 02 89 01 00 02 07 08"
        );
    }

    #[test]
    fn transaction_counter_wraps() {
        let mut bus = bus(TestLink::new(&[]));
        for expected in 1..=255u16 {
            assert_eq!(u16::from(bus.next_tran()), expected);
        }
        assert_eq!(bus.next_tran(), 0);
        assert_eq!(bus.next_tran(), 1);
    }

    #[test]
    fn first_send_rings_the_node() {
        let mut bus = bus(TestLink::new(&[]));
        bus.send(&[0x01]).unwrap();
        assert_eq!(&bus.link_mut().sent[..6], &[0xBD; 6]);
        bus.link_mut().sent.clear();
        bus.send(&[0x01]).unwrap();
        // only the frame delimiter this time, no attention run
        assert_ne!(&bus.link_mut().sent[..2], &[0xBD, 0xBD]);
    }

    /// Frames a packet the way it would arrive on the wire.
    fn wire(packet: &[u8]) -> Vec<u8> {
        let mut link = TestLink::new(&[]);
        crate::frame::send_frame(&mut link, packet).unwrap();
        link.sent
    }

    #[test]
    fn wait_answers_hello_probes_and_skips_stray_traffic() {
        let mut logger = peer(TestLink::new(&[]));
        let (probe, _) = logger.hello_cmd();
        let (response, tran) = logger.clock_cmd(NSec::default());
        // a clock "response" is easiest scripted as the peer's own
        // command bytes; here only addressing and transaction matter
        let mut response = response;
        response[8] = message::CLOCK_RESPONSE;

        // stray: response for someone else entirely
        let other = PakBus::new(TestLink::new(&[]), 0x003, 0x004, 0).hello_response(9);

        let mut script = wire(&other);
        script.extend(wire(&probe));
        script.extend(wire(&response));

        let mut bus = bus(TestLink::new(&script));
        let (_, msg) = bus.wait_for(tran).unwrap().unwrap();
        assert_eq!(msg.tran_nbr(), tran);
        match msg {
            Message::Clock(_) => {}
            other => panic!("unexpected message {:?}", other),
        }

        // the probe got answered on the way
        let sent = bus.link_mut().sent.clone();
        let expected = wire(&bus.hello_response(1));
        assert!(sent
            .windows(expected.len())
            .any(|w| w == expected.as_slice()));
    }

    #[test]
    fn wait_raises_on_delivery_failure() {
        let mut logger = peer(TestLink::new(&[]));
        let mut failure = logger.hello_response(7);
        failure[8] = message::FAILURE;
        failure.truncate(11);
        failure[10] = 0x02; // error code

        let mut bus = bus(TestLink::new(&wire(&failure)));
        match bus.wait_for(7) {
            Err(Error::DeliveryFailure(2)) => {}
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn wait_honours_please_wait() {
        let mut logger = peer(TestLink::new(&[]));
        let mut wait_msg = logger.hello_response(3);
        wait_msg.truncate(8);
        wait_msg.extend_from_slice(&[message::PLEASE_WAIT, 3, message::CLOCK_CMD, 0, 0]);
        // BMP5 please-wait needs a BMP5 header
        wait_msg[4] = 0x18;

        let mut clock_resp = logger.hello_response(3);
        clock_resp.truncate(8);
        clock_resp[4] = 0x18;
        clock_resp.extend_from_slice(&[message::CLOCK_RESPONSE, 3, 0]);
        clock_resp.extend_from_slice(&[0, 0, 0, 5, 0, 0, 0, 0]);

        let mut script = wire(&wait_msg);
        script.extend(wire(&clock_resp));
        let mut bus = bus(TestLink::new(&script));
        let (_, msg) = bus.wait_for(3).unwrap().unwrap();
        match msg {
            Message::Clock(clock) => assert_eq!(clock.time, NSec::new(5, 0)),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn wait_returns_none_on_silence() {
        let mut bus = bus(TestLink::new(&[]));
        assert!(bus.wait_for(1).unwrap().is_none());
    }
}
