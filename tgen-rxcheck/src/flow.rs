use tgen_timer::TimerHandle;

/// Per-direction progress of one verified flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirRecord {
    /// Packets the TX side declared for this direction.
    pub flow_size: u16,
    pub pkts: u16,
    /// Next expected packet id.
    pub seq: u16,
    fif_seen: bool,
}

impl DirRecord {
    /// Marks the direction initialized by its first observed packet.
    pub fn set_fif_seen(&mut self, flow_size: u16) {
        self.pkts = 1;
        self.seq = 1;
        self.flow_size = flow_size;
        self.fif_seen = true;
    }

    #[inline]
    pub fn is_fif_seen(&self) -> bool {
        self.fif_seen
    }
}

/// One tracked flow in the verification table, keyed by the marker's
/// flow id. Aged out by the engine's timer wheel when traffic stops.
#[derive(Debug)]
pub struct RxCheckFlow {
    pub flow_id: u64,
    pub dir: [DirRecord; 2],
    pub aging: TimerHandle,
    /// Out-of-order incidents on this flow; a completed flow must have none.
    pub oo_err: u16,
    pub both_dir: bool,
    pub aged_correctly: bool,
}

impl RxCheckFlow {
    pub fn new(flow_id: u64) -> Self {
        Self {
            flow_id,
            dir: [DirRecord::default(); 2],
            aging: TimerHandle::new(),
            oo_err: 0,
            both_dir: false,
            aged_correctly: false,
        }
    }

    pub fn total_seen(&self) -> u16 {
        self.dir[0].pkts + self.dir[1].pkts
    }

    pub fn total_expected(&self) -> u16 {
        self.dir[0].flow_size + self.dir[1].flow_size
    }

    /// A flow is complete when every declared direction delivered exactly
    /// its declared packet count, with no out-of-order incidents.
    pub fn is_all_pkts_seen(&self) -> bool {
        let mut dirs_seen = 0;
        for d in &self.dir {
            if d.pkts != d.flow_size {
                return false;
            }
            if d.flow_size > 0 {
                dirs_seen += 1;
            }
        }
        let expected = if self.both_dir { 2 } else { 1 };
        dirs_seen == expected && self.oo_err == 0
    }
}
