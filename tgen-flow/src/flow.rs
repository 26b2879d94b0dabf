use crate::{template::FlowTemplate, tuple::FlowKey, udp::UdpFlow};

/// State every flow variant carries: its table identity and the header
/// template for packets it originates.
#[derive(Debug)]
pub struct FlowBase {
    pub key: FlowKey,
    pub template: FlowTemplate,
}

/// A TCP connection entry.
///
/// The protocol machine itself (sequencing, congestion control,
/// retransmission) is external and driven through
/// [`FlowEnv::tcp_flow_input`](crate::FlowEnv::tcp_flow_input); the entry
/// only tracks identity and the close handshake outcome.
#[derive(Debug)]
pub struct TcpFlow {
    pub base: FlowBase,
    can_close: bool,
}

impl TcpFlow {
    pub fn new(base: FlowBase) -> Self {
        Self { base, can_close: false }
    }

    /// Set by the external TCP engine once the connection reached CLOSED.
    pub fn set_can_close(&mut self) {
        self.can_close = true;
    }

    #[inline]
    pub fn is_can_close(&self) -> bool {
        self.can_close
    }
}

/// The protocol dispatch surface. TCP and UDP are the closed set of flow
/// kinds, so this is a plain tagged union matched on the hot path.
#[derive(Debug)]
pub enum Flow {
    Tcp(TcpFlow),
    Udp(UdpFlow),
}

impl Flow {
    pub fn base(&self) -> &FlowBase {
        match self {
            Self::Tcp(f) => &f.base,
            Self::Udp(f) => &f.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut FlowBase {
        match self {
            Self::Tcp(f) => &mut f.base,
            Self::Udp(f) => &mut f.base,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.base().key
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Self::Udp(_))
    }
}
