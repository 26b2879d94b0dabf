use std::fmt;

use serde::Serialize;

/// Verification counters. Everything the engine observes lands here;
/// anomalies are counted, never raised.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RxCheckStats {
    pub total_rx: u64,
    pub total_rx_bytes: u64,

    pub lookup: u64,
    pub found: u64,
    /// First-in-flow packets that opened a flow.
    pub fif: u64,
    pub add: u64,
    pub remove: u64,
    pub active: u64,

    /// Expected packets that never arrived, summed at flow end.
    pub err_drop: u64,
    /// Flows removed by the ager instead of completing.
    pub err_aged: u64,
    pub err_no_magic: u64,
    pub err_wrong_pkt_id: u64,
    pub err_fif_seen_twice: u64,
    pub err_open_with_no_fif_pkt: u64,
    /// Same packet id twice in a row.
    pub err_oo_dup: u64,
    /// Sequence jumped ahead of the expected id: at least one packet is
    /// missing so far.
    pub err_oo_early: u64,
    /// Sequence went backwards: a packet arrived after its successor.
    pub err_oo_late: u64,
    pub err_flow_length_changed: u64,
}

impl RxCheckStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total_err(&self) -> u64 {
        self.err_drop
            + self.err_aged
            + self.err_no_magic
            + self.err_wrong_pkt_id
            + self.err_fif_seen_twice
            + self.err_open_with_no_fif_pkt
            + self.err_oo_dup
            + self.err_oo_early
            + self.err_oo_late
            + self.err_flow_length_changed
    }
}

macro_rules! dump_nz {
    ($f:expr, $self:expr, $($field:ident),+ $(,)?) => {
        $(
            if $self.$field != 0 {
                writeln!($f, " {:<32}: {}", stringify!($field), $self.$field)?;
            }
        )+
    };
}

impl fmt::Display for RxCheckStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dump_nz!(
            f,
            self,
            total_rx,
            total_rx_bytes,
            lookup,
            found,
            fif,
            add,
            remove,
        );
        // active is always shown, zero included
        writeln!(f, " {:<32}: {}", "active", self.active)?;
        dump_nz!(
            f,
            self,
            err_drop,
            err_aged,
            err_no_magic,
            err_wrong_pkt_id,
            err_fif_seen_twice,
            err_open_with_no_fif_pkt,
            err_oo_dup,
            err_oo_early,
            err_oo_late,
            err_flow_length_changed,
        );
        Ok(())
    }
}
