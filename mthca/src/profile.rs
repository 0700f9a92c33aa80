//! Resource profile computation.
//!
//! The profile is the capacity plan for one device open: how many of each
//! resource the device will be initialized with, the log2 sizes of the
//! on-device context tables, and the DDR request vector that backs them.
//! Computation is pure: device limits and an optional user hint in, a
//! validated plan out. When the plan does not fit the available on-board
//! memory the calculator backs off every adjustable count by a fixed
//! percentage and retries, down to per-resource floors.
//!
//! The defaults, floors, reduction percentage and soft caps below are
//! carried over from hardware bring-up and are deliberately not derived
//! from first principles.

use log::debug;

use crate::ddr::DdrRequest;
use crate::error::{Error, Result};
use crate::types::{DeviceCapFlags, DeviceLimits};

/// Sentinel for "let the planner choose" in a [`ProfileHint`] field.
pub const UNSPECIFIED: u32 = !0;

/// Default queue pair count.
pub const DEFAULT_NUM_QP: u32 = 1 << 16;
/// Default completion queue count.
pub const DEFAULT_NUM_CQ: u32 = 1 << 16;
/// Default shared receive queue count.
pub const DEFAULT_NUM_SRQ: u32 = 1 << 10;
/// Default multicast group count.
pub const DEFAULT_NUM_MCG: u32 = 1 << 13;
/// Default memory protection table entry count.
pub const DEFAULT_NUM_MPT: u32 = 1 << 17;
/// Default memory translation table segment count.
pub const DEFAULT_NUM_MTT_SEG: u32 = 1 << 20;
/// Default privileged address vector count.
pub const DEFAULT_NUM_UDAV: u32 = 1 << 15;
/// Event queues activated per device.
pub const DEFAULT_NUM_EQ: u32 = 32;

/// Backoff floor for queue pairs.
pub const FLOOR_NUM_QP: u32 = 1 << 12;
/// Backoff floor for completion queues.
pub const FLOOR_NUM_CQ: u32 = 1 << 12;
/// Backoff floor for shared receive queues.
pub const FLOOR_NUM_SRQ: u32 = 1 << 8;
/// Backoff floor for multicast groups.
pub const FLOOR_NUM_MCG: u32 = 1 << 7;
/// Backoff floor for memory protection entries.
pub const FLOOR_NUM_MPT: u32 = 1 << 13;
/// Backoff floor for memory translation segments.
pub const FLOOR_NUM_MTT_SEG: u32 = 1 << 16;
/// Backoff floor for privileged address vectors.
pub const FLOOR_NUM_UDAV: u32 = 1 << 10;

/// Percentage removed from every adjustable count per backoff pass.
pub const REDUCTION_PERCENT: u64 = 10;

/// Queue pair soft cap applied only to hintless plans.
pub const QP_SOFT_CAP: u32 = 1 << 15;

/// Work queue bytes reserved in DDR per queue pair.
pub const WQE_BYTES_PER_QP: u64 = 128;
/// Bytes per privileged address vector entry.
pub const UDAV_ENTRY_SIZE: u64 = 32;
/// Alignment of every context table in DDR.
pub const TABLE_ALIGN: u64 = 4096;

/// User resource-count hint for [`ResourceProfile::compute`].
///
/// Any count left [`UNSPECIFIED`] is filled from the built-in default.
/// By default out-of-range counts are rejected; `lenient` clamps them
/// instead, and `exact` forbids any backoff of the hinted counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileHint {
    /// Requested queue pairs.
    pub num_qps: u32,
    /// Requested completion queues.
    pub num_cqs: u32,
    /// Requested shared receive queues.
    pub num_srqs: u32,
    /// Requested multicast groups.
    pub num_mcgs: u32,
    /// Requested memory protection entries (regions plus windows).
    pub num_mpts: u32,
    /// Requested memory translation segments.
    pub num_mtt_segs: u32,
    /// Requested privileged address vectors.
    pub num_udavs: u32,
    /// Keep the address vector table in privileged on-device memory.
    pub privileged_udav: bool,
    /// Fail instead of backing off when the hinted counts do not fit.
    pub exact: bool,
    /// Clamp invalid counts into range instead of rejecting them.
    pub lenient: bool,
}

impl Default for ProfileHint {
    fn default() -> Self {
        Self {
            num_qps: UNSPECIFIED,
            num_cqs: UNSPECIFIED,
            num_srqs: UNSPECIFIED,
            num_mcgs: UNSPECIFIED,
            num_mpts: UNSPECIFIED,
            num_mtt_segs: UNSPECIFIED,
            num_udavs: UNSPECIFIED,
            privileged_udav: false,
            exact: false,
            lenient: false,
        }
    }
}

impl ProfileHint {
    /// Create a hint with every count unspecified.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the requested queue pair count.
    pub fn with_num_qps(mut self, n: u32) -> Self {
        self.num_qps = n;
        self
    }

    /// Set the requested completion queue count.
    pub fn with_num_cqs(mut self, n: u32) -> Self {
        self.num_cqs = n;
        self
    }

    /// Set the requested shared receive queue count.
    pub fn with_num_srqs(mut self, n: u32) -> Self {
        self.num_srqs = n;
        self
    }

    /// Set the requested multicast group count.
    pub fn with_num_mcgs(mut self, n: u32) -> Self {
        self.num_mcgs = n;
        self
    }

    /// Set the requested memory protection entry count.
    pub fn with_num_mpts(mut self, n: u32) -> Self {
        self.num_mpts = n;
        self
    }

    /// Set the requested memory translation segment count.
    pub fn with_num_mtt_segs(mut self, n: u32) -> Self {
        self.num_mtt_segs = n;
        self
    }

    /// Set the requested privileged address vector count.
    pub fn with_num_udavs(mut self, n: u32) -> Self {
        self.num_udavs = n;
        self
    }

    /// Request the privileged on-device address vector table.
    pub fn with_privileged_udav(mut self, enable: bool) -> Self {
        self.privileged_udav = enable;
        self
    }

    /// Require the hinted counts exactly; any backoff becomes an error.
    pub fn with_exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    /// Clamp out-of-range counts instead of rejecting the hint.
    pub fn with_lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }
}

/// The computed capacity plan for one device open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProfile {
    /// Planned queue pairs.
    pub num_qps: u32,
    /// log2 size of the QP context table.
    pub log2_qp: u8,
    /// Planned completion queues.
    pub num_cqs: u32,
    /// log2 size of the CQ context table.
    pub log2_cq: u8,
    /// Planned shared receive queues. Zero when SRQs are unsupported.
    pub num_srqs: u32,
    /// log2 size of the SRQ context table.
    pub log2_srq: u8,
    /// Planned multicast groups. Zero when multicast is absent.
    pub num_mcgs: u32,
    /// log2 size of the multicast group table.
    pub log2_mcg: u8,
    /// Planned memory protection entries.
    pub num_mpts: u32,
    /// log2 size of the memory protection table.
    pub log2_mpt: u8,
    /// Planned memory translation segments.
    pub num_mtt_segs: u32,
    /// log2 size of the memory translation table.
    pub log2_mtt: u8,
    /// Event queues to activate.
    pub num_eqs: u32,
    /// log2 size of the EQ context table.
    pub log2_eq: u8,
    /// Privileged address vectors. Zero when the table is disabled.
    pub num_udavs: u32,
    /// Whether the privileged address vector table is enabled.
    pub privileged_udav: bool,
    /// Doorbell page shift for this device.
    pub db_page_shift: u8,
    /// Ordered DDR request vector, one entry per hardware table.
    pub ddr_requests: Vec<DdrRequest>,
    /// Vector sum plus auxiliary reservations, in bytes.
    pub ddr_total: u64,
}

/// Working counts for the backoff loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counts {
    qps: u32,
    cqs: u32,
    srqs: u32,
    mcgs: u32,
    mpts: u32,
    mtt_segs: u32,
    udavs: u32,
}

/// Table sizing derived from one set of working counts.
struct Tables {
    log2_qp: u8,
    log2_cq: u8,
    log2_srq: u8,
    log2_mcg: u8,
    log2_mpt: u8,
    log2_mtt: u8,
    log2_eq: u8,
    requests: Vec<DdrRequest>,
    total: u64,
}

fn ceil_log2(count: u32, reserved: u32) -> u8 {
    (count as u64 + reserved as u64)
        .max(1)
        .next_power_of_two()
        .trailing_zeros() as u8
}

fn table_bytes(entry_size: u16, log2: u8) -> u64 {
    entry_size as u64 * (1u64 << log2)
}

fn reduce(count: u32, floor: u32) -> u32 {
    if count == 0 {
        return 0;
    }
    let cut = (count as u64 * (100 - REDUCTION_PERCENT) / 100) as u32;
    cut.max(floor.min(count))
}

impl ResourceProfile {
    /// Compute a plan from device limits, the DDR bytes available to the
    /// host, and an optional user hint.
    ///
    /// # Errors
    /// `InvalidArgument` for a hint that fails validation (zero counts,
    /// counts above device limits, translation segments inconsistent with
    /// protection entries, unsupported privileged address vectors) unless
    /// the hint is lenient. `ResourceExhausted` when no plan fits the
    /// available DDR even with every count at its floor, or when an exact
    /// hint would have to be reduced.
    pub fn compute(
        limits: &DeviceLimits,
        ddr_avail: u64,
        hint: Option<&ProfileHint>,
    ) -> Result<Self> {
        let exact = hint.map_or(false, |h| h.exact);
        let privileged_udav = Self::resolve_udav(limits, hint)?;
        let mut counts = Self::seed_counts(limits, hint, privileged_udav)?;
        let num_eqs = DEFAULT_NUM_EQ.min(limits.max_eqs.saturating_sub(limits.reserved_eqs));

        let mut tables = loop {
            let tables = Self::size_tables(limits, counts, num_eqs, privileged_udav);
            if tables.total <= ddr_avail && (hint.is_some() || counts.qps <= QP_SOFT_CAP) {
                break tables;
            }
            if exact {
                return Err(Error::ResourceExhausted);
            }
            let before = counts;
            counts = Counts {
                qps: reduce(counts.qps, FLOOR_NUM_QP),
                cqs: reduce(counts.cqs, FLOOR_NUM_CQ),
                srqs: reduce(counts.srqs, FLOOR_NUM_SRQ),
                mcgs: reduce(counts.mcgs, FLOOR_NUM_MCG),
                mpts: reduce(counts.mpts, FLOOR_NUM_MPT),
                mtt_segs: reduce(counts.mtt_segs, FLOOR_NUM_MTT_SEG),
                udavs: reduce(counts.udavs, FLOOR_NUM_UDAV),
            };
            if counts == before {
                debug!(
                    "profile: no further reduction possible, needed {} of {} DDR bytes",
                    tables.total, ddr_avail
                );
                return Err(Error::ResourceExhausted);
            }
        };

        // Reserved headroom alone may push a table past a power-of-two
        // boundary, doubling it for a handful of firmware entries. Trim
        // the translation table back one step in that case; the hinted
        // count shrinks, so exact hints keep the larger table.
        if !exact && ceil_log2(counts.mtt_segs, 0) < ceil_log2(counts.mtt_segs, limits.reserved_mtt_segs) {
            let log2 = ceil_log2(counts.mtt_segs, limits.reserved_mtt_segs) - 1;
            let capacity = 1u64 << log2;
            if capacity > limits.reserved_mtt_segs as u64 {
                counts.mtt_segs = (capacity - limits.reserved_mtt_segs as u64) as u32;
                tables = Self::size_tables(limits, counts, num_eqs, privileged_udav);
            }
        }

        debug!(
            "profile: {} qps, {} cqs, {} mpts, {} mtt segs, {} of {} DDR bytes",
            counts.qps, counts.cqs, counts.mpts, counts.mtt_segs, tables.total, ddr_avail
        );

        Ok(Self {
            num_qps: counts.qps,
            log2_qp: tables.log2_qp,
            num_cqs: counts.cqs,
            log2_cq: tables.log2_cq,
            num_srqs: counts.srqs,
            log2_srq: tables.log2_srq,
            num_mcgs: counts.mcgs,
            log2_mcg: tables.log2_mcg,
            num_mpts: counts.mpts,
            log2_mpt: tables.log2_mpt,
            num_mtt_segs: counts.mtt_segs,
            log2_mtt: tables.log2_mtt,
            num_eqs,
            log2_eq: tables.log2_eq,
            num_udavs: counts.udavs,
            privileged_udav,
            db_page_shift: limits.db_page_shift,
            ddr_requests: tables.requests,
            ddr_total: tables.total,
        })
    }

    fn resolve_udav(limits: &DeviceLimits, hint: Option<&ProfileHint>) -> Result<bool> {
        let supported = limits.flags.contains(DeviceCapFlags::PRIV_UDAV);
        match hint {
            None => Ok(supported),
            Some(h) if !h.privileged_udav => Ok(false),
            Some(h) => {
                if supported {
                    Ok(true)
                } else if h.lenient {
                    Ok(false)
                } else {
                    Err(Error::InvalidArgument("privileged address vectors unsupported"))
                }
            }
        }
    }

    fn seed_counts(
        limits: &DeviceLimits,
        hint: Option<&ProfileHint>,
        privileged_udav: bool,
    ) -> Result<Counts> {
        // A default substituted for an unspecified field is clamped into
        // range; only counts the caller actually wrote are validated.
        fn resolve(
            hinted: u32,
            default: u32,
            max: u32,
            supported: bool,
            strict: bool,
            what: &'static str,
        ) -> Result<u32> {
            if !supported {
                return Ok(0);
            }
            if hinted == UNSPECIFIED {
                return Ok(default.min(max));
            }
            if strict {
                if hinted == 0 {
                    return Err(Error::InvalidArgument("zero resource count"));
                }
                if hinted > max {
                    return Err(Error::InvalidArgument(what));
                }
                Ok(hinted)
            } else {
                Ok(if hinted == 0 { default } else { hinted }.min(max))
            }
        }

        let h = hint.copied().unwrap_or_default();
        let strict = hint.is_some() && !h.lenient;
        let mut counts = Counts {
            qps: resolve(h.num_qps, DEFAULT_NUM_QP, limits.max_qps, true, strict, "queue pair count")?,
            cqs: resolve(h.num_cqs, DEFAULT_NUM_CQ, limits.max_cqs, true, strict, "completion queue count")?,
            srqs: resolve(
                h.num_srqs,
                DEFAULT_NUM_SRQ,
                limits.max_srqs,
                limits.has_srq(),
                strict,
                "shared receive queue count",
            )?,
            mcgs: resolve(
                h.num_mcgs,
                DEFAULT_NUM_MCG,
                limits.max_mcgs,
                limits.has_multicast(),
                strict,
                "multicast group count",
            )?,
            mpts: resolve(h.num_mpts, DEFAULT_NUM_MPT, limits.max_mpts, true, strict, "memory protection entry count")?,
            mtt_segs: resolve(
                h.num_mtt_segs,
                DEFAULT_NUM_MTT_SEG,
                limits.max_mtt_segs,
                true,
                strict,
                "translation segment count",
            )?,
            udavs: resolve(
                h.num_udavs,
                DEFAULT_NUM_UDAV,
                u32::MAX,
                privileged_udav,
                strict,
                "address vector count",
            )?,
        };

        if counts.mtt_segs < counts.mpts {
            if strict && (h.num_mpts != UNSPECIFIED || h.num_mtt_segs != UNSPECIFIED) {
                return Err(Error::InvalidArgument(
                    "translation segments cannot cover protection entries",
                ));
            }
            counts.mpts = counts.mtt_segs;
        }
        Ok(counts)
    }

    fn size_tables(
        limits: &DeviceLimits,
        counts: Counts,
        num_eqs: u32,
        privileged_udav: bool,
    ) -> Tables {
        let log2_qp = ceil_log2(counts.qps, limits.reserved_qps);
        let log2_cq = ceil_log2(counts.cqs, limits.reserved_cqs);
        let log2_srq = ceil_log2(counts.srqs, limits.reserved_srqs);
        let log2_mcg = ceil_log2(counts.mcgs, 0);
        let log2_mpt = ceil_log2(counts.mpts, limits.reserved_mpts);
        let log2_mtt = ceil_log2(counts.mtt_segs, limits.reserved_mtt_segs);
        let log2_eq = ceil_log2(num_eqs, limits.reserved_eqs);

        let mut requests = vec![
            DdrRequest {
                name: "qpc",
                size: table_bytes(limits.qpc_entry_size, log2_qp),
                align: TABLE_ALIGN,
            },
            DdrRequest {
                name: "cqc",
                size: table_bytes(limits.cqc_entry_size, log2_cq),
                align: TABLE_ALIGN,
            },
        ];
        if counts.srqs > 0 {
            requests.push(DdrRequest {
                name: "srqc",
                size: table_bytes(limits.srqc_entry_size, log2_srq),
                align: TABLE_ALIGN,
            });
        }
        requests.push(DdrRequest {
            name: "eqc",
            size: table_bytes(limits.eqc_entry_size, log2_eq),
            align: TABLE_ALIGN,
        });
        requests.push(DdrRequest {
            name: "mpt",
            size: table_bytes(limits.mpt_entry_size, log2_mpt),
            align: TABLE_ALIGN,
        });
        requests.push(DdrRequest {
            name: "mtt",
            size: table_bytes(limits.mtt_seg_size, log2_mtt),
            align: TABLE_ALIGN,
        });
        if counts.mcgs > 0 {
            requests.push(DdrRequest {
                name: "mcg",
                size: table_bytes(limits.mcg_entry_size, log2_mcg),
                align: TABLE_ALIGN,
            });
        }

        let vector_sum: u64 = requests.iter().map(|r| r.size).sum();
        let aux = counts.qps as u64 * WQE_BYTES_PER_QP
            + if privileged_udav {
                counts.udavs as u64 * UDAV_ENTRY_SIZE
            } else {
                0
            };

        Tables {
            log2_qp,
            log2_cq,
            log2_srq,
            log2_mcg,
            log2_mpt,
            log2_mtt,
            log2_eq,
            requests,
            total: vector_sum + aux,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceCapFlags;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            max_qps: 1 << 16,
            reserved_qps: 32,
            max_srqs: 1 << 10,
            reserved_srqs: 8,
            max_cqs: 1 << 13,
            reserved_cqs: 16,
            max_eqs: 64,
            reserved_eqs: 4,
            max_mpts: 1 << 17,
            reserved_mpts: 16,
            max_mtt_segs: 1 << 20,
            reserved_mtt_segs: 32,
            max_pds: 1 << 16,
            reserved_pds: 4,
            max_mcgs: 1 << 13,
            max_uars: 1 << 10,
            reserved_uars: 2,
            num_ports: 2,
            db_page_shift: 12,
            qpc_entry_size: 256,
            srqc_entry_size: 64,
            cqc_entry_size: 64,
            eqc_entry_size: 64,
            mpt_entry_size: 64,
            mtt_seg_size: 64,
            mcg_entry_size: 64,
            flags: DeviceCapFlags::RC_TRANSPORT
                | DeviceCapFlags::UD_TRANSPORT
                | DeviceCapFlags::SRQ
                | DeviceCapFlags::MULTICAST
                | DeviceCapFlags::PRIV_UDAV,
        }
    }

    const DDR_256M: u64 = 256 << 20;

    #[test]
    fn test_null_hint_fits_limits_and_ddr() {
        let l = limits();
        let p = ResourceProfile::compute(&l, DDR_256M, None).expect("plan");
        assert!(p.ddr_total <= DDR_256M);
        assert!(p.num_qps <= l.max_qps && p.num_qps >= FLOOR_NUM_QP);
        assert!(p.num_cqs <= l.max_cqs);
        assert!(p.num_mpts <= l.max_mpts);
        assert!(p.num_mtt_segs <= l.max_mtt_segs);
        let vector_sum: u64 = p.ddr_requests.iter().map(|r| r.size).sum();
        assert!(vector_sum <= p.ddr_total);
    }

    #[test]
    fn test_hintless_qp_soft_cap_applies() {
        let p = ResourceProfile::compute(&limits(), DDR_256M, None).expect("plan");
        assert!(p.num_qps <= QP_SOFT_CAP);
    }

    #[test]
    fn test_soft_cap_does_not_apply_to_hints() {
        let hint = ProfileHint::new().with_num_qps(QP_SOFT_CAP + 1000);
        let p = ResourceProfile::compute(&limits(), DDR_256M, Some(&hint)).expect("plan");
        assert_eq!(p.num_qps, QP_SOFT_CAP + 1000);
    }

    #[test]
    fn test_exact_hint_returned_unreduced() {
        let hint = ProfileHint::new()
            .with_num_qps(5000)
            .with_num_cqs(600)
            .with_exact(true);
        let p = ResourceProfile::compute(&limits(), DDR_256M, Some(&hint)).expect("plan");
        assert_eq!(p.num_qps, 5000);
        assert_eq!(p.num_cqs, 600);
        // log2 sizes cover the count plus firmware reservations.
        assert!(1u64 << p.log2_qp >= 5000 + limits().reserved_qps as u64);
    }

    #[test]
    fn test_exact_hint_that_needs_reduction_fails() {
        let hint = ProfileHint::new().with_exact(true);
        // Far too little DDR for the defaults.
        assert_eq!(
            ResourceProfile::compute(&limits(), 1 << 20, Some(&hint)),
            Err(Error::ResourceExhausted)
        );
    }

    #[test]
    fn test_floors_are_a_fixed_point() {
        // Cannot fit even with every count at its floor: the loop must
        // terminate with ResourceExhausted rather than spin.
        assert_eq!(
            ResourceProfile::compute(&limits(), 1 << 16, None),
            Err(Error::ResourceExhausted)
        );
    }

    #[test]
    fn test_reduction_converges_between_floor_and_default() {
        // Enough DDR for the floors but not the defaults.
        let p = ResourceProfile::compute(&limits(), 24 << 20, None).expect("plan");
        assert!(p.ddr_total <= 24 << 20);
        assert!(p.num_mtt_segs >= FLOOR_NUM_MTT_SEG);
        assert!(p.num_mtt_segs < DEFAULT_NUM_MTT_SEG);
    }

    #[test]
    fn test_zero_count_hint_rejected() {
        let hint = ProfileHint::new().with_num_cqs(0);
        assert_eq!(
            ResourceProfile::compute(&limits(), DDR_256M, Some(&hint)),
            Err(Error::InvalidArgument("zero resource count"))
        );
    }

    #[test]
    fn test_over_limit_hint_rejected() {
        let l = limits();
        let hint = ProfileHint::new().with_num_qps(l.max_qps + 1);
        assert_eq!(
            ResourceProfile::compute(&l, DDR_256M, Some(&hint)),
            Err(Error::InvalidArgument("queue pair count"))
        );
    }

    #[test]
    fn test_lenient_hint_clamps_instead() {
        let l = limits();
        let hint = ProfileHint::new()
            .with_num_qps(l.max_qps + 1)
            .with_num_cqs(0)
            .with_lenient(true);
        let p = ResourceProfile::compute(&l, DDR_256M, Some(&hint)).expect("plan");
        assert_eq!(p.num_qps, l.max_qps);
        assert_eq!(p.num_cqs, DEFAULT_NUM_CQ.min(l.max_cqs));
    }

    #[test]
    fn test_mtt_must_cover_mpt() {
        let hint = ProfileHint::new()
            .with_num_mpts(1 << 16)
            .with_num_mtt_segs(1 << 10);
        assert!(matches!(
            ResourceProfile::compute(&limits(), DDR_256M, Some(&hint)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_multicast_absent_zeroes_plan() {
        let mut l = limits();
        l.flags.remove(DeviceCapFlags::MULTICAST);
        let p = ResourceProfile::compute(&l, DDR_256M, None).expect("plan");
        assert_eq!(p.num_mcgs, 0);
        assert!(p.ddr_requests.iter().all(|r| r.name != "mcg"));
    }

    #[test]
    fn test_headroom_trim_shrinks_mtt_table() {
        // 2^20 segments plus 32 reserved would double the table; the
        // planner trims back one power of two instead.
        let hint = ProfileHint::new().with_num_mtt_segs(1 << 20);
        let p = ResourceProfile::compute(&limits(), 512 << 20, Some(&hint)).expect("plan");
        assert_eq!(p.log2_mtt, 20);
        assert_eq!(p.num_mtt_segs, (1 << 20) - limits().reserved_mtt_segs);
    }

    #[test]
    fn test_exact_hint_keeps_headroom() {
        let hint = ProfileHint::new().with_num_mtt_segs(1 << 20).with_exact(true);
        let p = ResourceProfile::compute(&limits(), 512 << 20, Some(&hint)).expect("plan");
        assert_eq!(p.log2_mtt, 21);
        assert_eq!(p.num_mtt_segs, 1 << 20);
    }

    #[test]
    fn test_privileged_udav_requires_support() {
        let mut l = limits();
        l.flags.remove(DeviceCapFlags::PRIV_UDAV);
        let hint = ProfileHint::new().with_privileged_udav(true);
        assert!(matches!(
            ResourceProfile::compute(&l, DDR_256M, Some(&hint)),
            Err(Error::InvalidArgument(_))
        ));
        let lenient = hint.with_lenient(true);
        let p = ResourceProfile::compute(&l, DDR_256M, Some(&lenient)).expect("plan");
        assert!(!p.privileged_udav);
        assert_eq!(p.num_udavs, 0);
    }
}
