//! Frame buffer with bounds-checked access.
//!
//! Mirrors the helper surface a classifier program has on a socket buffer:
//! offset based loads and stores plus incremental L3/L4 checksum replacement.
//! Reads past the captured data fail with [`DropReason::InvalidPacket`],
//! writes that do not fit fail with [`DropReason::WriteError`].

use crate::csum::{self, CsumOffset};
use crate::error::{DropReason, Result};
use ipve_common::{ETH_ALEN, ETH_HLEN};
use smoltcp::wire::{EthernetFrame, EthernetProtocol};

/// An Ethernet frame being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// EtherType of the frame, `None` if there is no complete L2 header.
    pub fn protocol(&self) -> Option<EthernetProtocol> {
        EthernetFrame::new_checked(&self.buf[..])
            .ok()
            .map(|frame| frame.ethertype())
    }

    /// Fail unless `len` bytes starting at `off` are present.
    pub fn ensure(&self, off: usize, len: usize) -> Result<()> {
        match off.checked_add(len) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(DropReason::InvalidPacket),
        }
    }

    pub fn load_bytes<const N: usize>(&self, off: usize) -> Result<[u8; N]> {
        self.ensure(off, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[off..off + N]);
        Ok(out)
    }

    pub fn load_u8(&self, off: usize) -> Result<u8> {
        self.ensure(off, 1)?;
        Ok(self.buf[off])
    }

    pub fn load_be16(&self, off: usize) -> Result<u16> {
        self.load_bytes::<2>(off).map(u16::from_be_bytes)
    }

    pub fn load_be32(&self, off: usize) -> Result<u32> {
        self.load_bytes::<4>(off).map(u32::from_be_bytes)
    }

    pub fn store_bytes(&mut self, off: usize, data: &[u8]) -> Result<()> {
        match off.checked_add(data.len()) {
            Some(end) if end <= self.buf.len() => {
                self.buf[off..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(DropReason::WriteError),
        }
    }

    /// Patch the 16-bit L3 checksum at `csum_off` for a field change.
    pub fn l3_csum_replace(&mut self, csum_off: usize, old: &[u8], new: &[u8]) -> Result<()> {
        let check = self
            .load_be16(csum_off)
            .map_err(|_| DropReason::ChecksumL3)?;
        let check = csum::replace(check, old, new);
        self.store_bytes(csum_off, &check.to_be_bytes())
            .map_err(|_| DropReason::ChecksumL3)
    }

    /// Patch the L4 checksum of the header at `l4_off` for a field change.
    ///
    /// `pseudo_hdr` marks changes to fields that are only covered through the
    /// pseudo header (addresses); they are skipped for checksums that do not
    /// include one.
    pub fn l4_csum_replace(
        &mut self,
        l4_off: usize,
        csum_off: &CsumOffset,
        old: &[u8],
        new: &[u8],
        pseudo_hdr: bool,
    ) -> Result<()> {
        if !csum_off.is_some() || (pseudo_hdr && !csum_off.pseudo) {
            return Ok(());
        }
        let off = l4_off + csum_off.offset;
        let check = self.load_be16(off).map_err(|_| DropReason::ChecksumL4)?;
        if csum_off.mangled_0 && check == 0 {
            return Ok(());
        }
        let mut check = csum::replace(check, old, new);
        if csum_off.mangled_0 && check == 0 {
            check = 0xffff;
        }
        self.store_bytes(off, &check.to_be_bytes())
            .map_err(|_| DropReason::ChecksumL4)
    }

    pub fn dst_mac(&self) -> Result<[u8; 6]> {
        self.load_bytes::<ETH_ALEN>(0)
    }

    pub fn src_mac(&self) -> Result<[u8; 6]> {
        self.load_bytes::<ETH_ALEN>(ETH_ALEN)
    }

    /// Rewrite the L2 addresses. `None` leaves that address untouched.
    pub fn store_macs(&mut self, smac: Option<[u8; 6]>, dmac: Option<[u8; 6]>) -> Result<()> {
        if self.buf.len() < ETH_HLEN {
            return Err(DropReason::WriteError);
        }
        if let Some(dmac) = dmac {
            self.store_bytes(0, &dmac)?;
        }
        if let Some(smac) = smac {
            self.store_bytes(ETH_ALEN, &smac)?;
        }
        Ok(())
    }
}

impl From<Vec<u8>> for Packet {
    fn from(buf: Vec<u8>) -> Self {
        Self::new(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let pkt = Packet::new(vec![0u8; 16]);
        assert!(pkt.load_be16(14).is_ok());
        assert_eq!(pkt.load_be16(15), Err(DropReason::InvalidPacket));
        assert_eq!(pkt.load_be32(usize::MAX), Err(DropReason::InvalidPacket));
    }

    #[test]
    fn test_store_out_of_range() {
        let mut pkt = Packet::new(vec![0u8; 4]);
        assert_eq!(pkt.store_bytes(3, &[1, 2]), Err(DropReason::WriteError));
        assert!(pkt.store_bytes(2, &[1, 2]).is_ok());
        assert_eq!(pkt.data(), &[0, 0, 1, 2]);
    }

    #[test]
    fn test_protocol() {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&[0x86, 0xdd]);
        assert_eq!(Packet::new(frame).protocol(), Some(EthernetProtocol::Ipv6));
        assert_eq!(Packet::new(vec![0u8; 10]).protocol(), None);
    }

    #[test]
    fn test_store_macs() {
        let mut pkt = Packet::new(vec![0u8; 14]);
        pkt.store_macs(Some([1; 6]), Some([2; 6])).unwrap();
        assert_eq!(pkt.dst_mac().unwrap(), [2; 6]);
        assert_eq!(pkt.src_mac().unwrap(), [1; 6]);

        pkt.store_macs(None, Some([3; 6])).unwrap();
        assert_eq!(pkt.dst_mac().unwrap(), [3; 6]);
        assert_eq!(pkt.src_mac().unwrap(), [1; 6]);
    }

    #[test]
    fn test_udp_zero_checksum_untouched() {
        let mut pkt = Packet::new(vec![0u8; 8]);
        let off = crate::csum::csum_l4_offset_and_flags(ipve_common::IPPROTO_UDP);
        pkt.l4_csum_replace(0, &off, &[0, 1], &[0, 2], false).unwrap();
        assert_eq!(pkt.load_be16(6).unwrap(), 0);
    }
}
