//! The 8-byte PakBus link/network header.
//!
//! The header is four big-endian 16-bit words holding the link state,
//! physical addresses, delivery hints and the higher-level protocol
//! selector:
//!
//! ```text
//! W0 = link_state(4) ‖ dst_phy(12)
//! W1 = exp_more(2) ‖ priority(2) ‖ src_phy(12)
//! W2 = hi_proto(4) ‖ dst_node(12)
//! W3 = hops(4) ‖ src_node(12)
//! ```

use std::convert::TryInto;

use bitmatch::bitmatch;

use crate::error::{Error, Result};

/// Link state: ring the peer to open a session.
pub const RING: u8 = 0x9;
/// Link state: session established.
pub const READY: u8 = 0xA;
/// Link state: closing the session.
pub const FINISHED: u8 = 0xB;

/// Higher-level protocol: PakBus control messages.
pub const PAKCTRL: u8 = 0x0;
/// Higher-level protocol: BMP5 application messages.
pub const BMP5: u8 = 0x1;

/// Number of bytes a packed header occupies.
pub const HEADER_LEN: usize = 8;

/// A decoded link/network header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Header {
    pub link_state: u8,
    pub dst_phy: u16,
    pub exp_more: u8,
    pub priority: u8,
    pub src_phy: u16,
    pub hi_proto: u8,
    pub dst_node: u16,
    pub hops: u8,
    pub src_node: u16,
}

impl Header {
    /// Header for an outgoing packet. Physical and node addresses are
    /// the same for an adjacent node; priority and hop count take
    /// their defaults.
    pub fn new(hi_proto: u8, exp_more: u8, link_state: u8, dst: u16, src: u16) -> Self {
        Header {
            link_state,
            dst_phy: dst,
            exp_more,
            priority: 0x1,
            src_phy: src,
            hi_proto,
            dst_node: dst,
            hops: 0x0,
            src_node: src,
        }
    }

    /// Packs into the four wire words.
    #[bitmatch]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let l = u16::from(self.link_state);
        let d = self.dst_phy;
        let e = u16::from(self.exp_more);
        let p = u16::from(self.priority);
        let s = self.src_phy;
        let h = u16::from(self.hi_proto);
        let n = self.dst_node;
        let c = u16::from(self.hops);
        let m = self.src_node;

        let words: [u16; 4] = [
            bitpack!("llll_dddd_dddd_dddd"),
            bitpack!("eepp_ssss_ssss_ssss"),
            bitpack!("hhhh_nnnn_nnnn_nnnn"),
            bitpack!("cccc_mmmm_mmmm_mmmm"),
        ];

        let mut bytes = [0u8; HEADER_LEN];
        for (chunk, word) in bytes.chunks_exact_mut(2).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    /// Unpacks the leading header of a packet.
    #[bitmatch]
    pub fn from_bytes(packet: &[u8]) -> Result<Self> {
        if packet.len() < HEADER_LEN {
            return Err(Error::BadData(format!(
                "packet of {} bytes is shorter than a header",
                packet.len()
            )));
        }
        let word = |i: usize| u16::from_be_bytes(packet[2 * i..2 * i + 2].try_into().unwrap());

        #[bitmatch]
        let "llll_dddd_dddd_dddd" = word(0);
        #[bitmatch]
        let "eepp_ssss_ssss_ssss" = word(1);
        #[bitmatch]
        let "hhhh_nnnn_nnnn_nnnn" = word(2);
        #[bitmatch]
        let "cccc_mmmm_mmmm_mmmm" = word(3);

        Ok(Header {
            link_state: l as u8,
            dst_phy: d,
            exp_more: e as u8,
            priority: p as u8,
            src_phy: s,
            hi_proto: h as u8,
            dst_node: n,
            hops: c as u8,
            src_node: m,
        })
    }
}
