//! DRBD Metadata Sizing
//!
//! Size of the DRBD metadata area (superblock, activity log and per-peer
//! bitmaps) and the resulting net/gross device sizes. All values in KiB.

use crate::error::{Error, Result};

// =============================================================================
// Format Constants
// =============================================================================

pub const MD_ALIGN_KIB: u64 = 4;
pub const BM_ALIGN_KIB: u64 = 4;
/// Alignment of each peer's bitmap, in bytes
pub const BM_PEER_ALIGN: u64 = 8;
/// One bitmap bit covers 4 KiB
pub const BM_BIT_COVER_KIB: u64 = 4;
/// One bitmap byte covers 32 KiB
pub const BM_BYTE_COVER_KIB: u64 = 32;
pub const DEFAULT_AL_KIB: u64 = 32;
pub const MIN_AL_KIB: u64 = 4;
pub const MAX_AL_KIB: u64 = 1_048_576;
pub const AL_ALIGN_KIB: u64 = 4;
pub const MD_SUPERBLOCK_KIB: u64 = 4;
pub const MAX_KIB: u64 = 1 << 40;
pub const MIN_GROSS_KIB: u64 = 68;
pub const MIN_NET_KIB: u64 = 4;
pub const MIN_PEERS: u16 = 1;
pub const MAX_PEERS: u16 = 31;
pub const MIN_EXT_META_KIB: u64 = 1024;
const DIVISOR_KIB: u64 = 1024;

/// Whether a size passed to [`MdLayout::internal_md_size`] is net or gross
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdSizeMode {
    Net,
    Gross,
}

// =============================================================================
// Metadata Layout
// =============================================================================

/// Parameters that determine the metadata layout of a DRBD volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdLayout {
    pub peers: u16,
    pub al_stripes: u32,
    pub al_stripe_size_kib: u64,
}

impl MdLayout {
    pub fn new(peers: u16, al_stripes: u32, al_stripe_size_kib: u64) -> Self {
        Self {
            peers,
            al_stripes,
            al_stripe_size_kib,
        }
    }

    /// Check peers and activity log parameters without any size input
    pub fn validate(&self) -> Result<()> {
        check_peers(self.peers)?;
        self.al_size()?;
        Ok(())
    }

    /// Net (usable) size of a device with internal metadata
    pub fn net_size(&self, gross_kib: u64) -> Result<u64> {
        self.validate()?;
        check_max(gross_kib)?;
        let bitmap = self.bitmap_internal_gross(gross_kib)?;
        let md = align_up(bitmap + self.al_size()? + MD_SUPERBLOCK_KIB, MD_ALIGN_KIB);
        let gross_eff = align_down(gross_kib, BM_BIT_COVER_KIB);
        if md >= gross_eff {
            return Err(Error::MinSize {
                size_kib: gross_kib,
            });
        }
        Ok(gross_eff - md)
    }

    /// Gross (on-disk) size of a device with internal metadata
    pub fn gross_size(&self, net_kib: u64) -> Result<u64> {
        self.validate()?;
        let bitmap = self.bitmap_internal_net(net_kib)?;
        let md = align_up(bitmap + self.al_size()? + MD_SUPERBLOCK_KIB, MD_ALIGN_KIB);
        let gross = align_up(net_kib, BM_BIT_COVER_KIB) + md;
        check_max(gross)?;
        Ok(gross.max(MIN_GROSS_KIB))
    }

    /// Size of the internal metadata area for a net or gross size
    pub fn internal_md_size(&self, mode: MdSizeMode, size_kib: u64) -> Result<u64> {
        self.validate()?;
        let size_eff = align_up(size_kib, BM_BIT_COVER_KIB);
        let bitmap = match mode {
            MdSizeMode::Net => self.bitmap_internal_net(size_eff)?,
            MdSizeMode::Gross => self.bitmap_internal_gross(size_eff)?,
        };
        Ok(align_up(
            self.al_size()? + bitmap + MD_SUPERBLOCK_KIB,
            MD_ALIGN_KIB,
        ))
    }

    /// Size of an external metadata device for a data device of `size_kib`
    pub fn external_md_size(&self, size_kib: u64) -> Result<u64> {
        self.validate()?;
        check_max(size_kib)?;
        let size_eff = align_up(size_kib, BM_BIT_COVER_KIB);
        let bitmap = self.bitmap_external(size_eff)?;
        let md = align_up(self.al_size()? + bitmap + MD_SUPERBLOCK_KIB, MD_ALIGN_KIB);
        Ok(md.max(MIN_EXT_META_KIB))
    }

    fn al_size(&self) -> Result<u64> {
        if self.al_stripes < 1 {
            return Err(Error::AlStripes {
                stripes: self.al_stripes,
            });
        }
        if self.al_stripe_size_kib > MAX_AL_KIB {
            return Err(Error::MaxAlSize {
                size_kib: self.al_stripe_size_kib,
            });
        }
        let al = align_up(
            self.al_stripe_size_kib.saturating_mul(self.al_stripes as u64),
            AL_ALIGN_KIB,
        );
        if al < MIN_AL_KIB {
            return Err(Error::MinAlSize { size_kib: al });
        }
        if al > MAX_AL_KIB {
            return Err(Error::MaxAlSize { size_kib: al });
        }
        Ok(al)
    }

    /// Bitmap size of a peer set, from the number of covered bytes per peer
    fn bitmap_for(&self, peer_bytes: u64) -> u64 {
        let bytes = peer_bytes * self.peers as u64;
        align_up(align_up(bytes, DIVISOR_KIB) / DIVISOR_KIB, BM_ALIGN_KIB)
    }

    fn bitmap_external(&self, size_kib: u64) -> Result<u64> {
        check_min_net(size_kib)?;
        check_max(size_kib)?;
        let size_eff = align_up(size_kib, BM_BIT_COVER_KIB);
        let peer_bytes = align_up(ceiling_divide(size_eff, BM_BYTE_COVER_KIB), BM_PEER_ALIGN);
        Ok(self.bitmap_for(peer_bytes))
    }

    /// Bitmap of a device with internal metadata, given its net size.
    ///
    /// The bitmap also has to cover the metadata area itself, so the gross
    /// size is grown until the bitmap covers it.
    fn bitmap_internal_net(&self, net_kib: u64) -> Result<u64> {
        check_min_net(net_kib)?;
        check_max(net_kib)?;
        let net_eff = align_up(net_kib, BM_BIT_COVER_KIB);
        let base = net_eff + self.al_size()? + MD_SUPERBLOCK_KIB;

        let mut gross = base;
        let mut bitmap = 0;
        let mut covered = 0;
        while covered < gross {
            let peer_bytes = align_up(ceiling_divide(gross, BM_BYTE_COVER_KIB), BM_PEER_ALIGN);
            covered = peer_bytes * BM_BYTE_COVER_KIB;
            bitmap = self.bitmap_for(peer_bytes);
            gross = base + bitmap;
        }
        check_max(gross)?;
        Ok(bitmap)
    }

    fn bitmap_internal_gross(&self, gross_kib: u64) -> Result<u64> {
        check_min_gross(gross_kib)?;
        check_max(gross_kib)?;
        let gross_eff = align_up(gross_kib, BM_BIT_COVER_KIB);
        let peer_bytes = align_up(ceiling_divide(gross_eff, BM_BYTE_COVER_KIB), BM_PEER_ALIGN);
        Ok(self.bitmap_for(peer_bytes))
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn check_peers(peers: u16) -> Result<()> {
    if !(MIN_PEERS..=MAX_PEERS).contains(&peers) {
        return Err(Error::PeerCount { peers });
    }
    Ok(())
}

fn check_min_net(size_kib: u64) -> Result<()> {
    if size_kib < MIN_NET_KIB {
        return Err(Error::MinSize { size_kib });
    }
    Ok(())
}

fn check_min_gross(size_kib: u64) -> Result<()> {
    if size_kib < MIN_GROSS_KIB {
        return Err(Error::MinSize { size_kib });
    }
    Ok(())
}

fn check_max(size_kib: u64) -> Result<()> {
    if size_kib > MAX_KIB {
        return Err(Error::MaxSize { size_kib });
    }
    Ok(())
}

fn ceiling_divide(dividend: u64, divisor: u64) -> u64 {
    dividend.div_ceil(divisor)
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    (value / alignment) * alignment
}
