//! Flow classification and lifecycle for the tgen data plane.
//!
//! One [`FlowTable`] per traffic side per worker maps a reduced 5-tuple to a
//! flow entry, originates server flows from incoming traffic and drives UDP
//! keepalives off a shared timer wheel. The TCP protocol machine and the
//! application layer stay outside, behind [`FlowEnv`].

mod flow;
mod hooks;
mod stats;
mod table;
mod template;
mod tuple;
mod udp;

pub use flow::{Flow, FlowBase, TcpFlow};
pub use hooks::{FlowContext, FlowEnv, RstInfo};
pub use stats::{FlowTableStats, UdpStats};
pub use table::FlowTable;
pub use template::{offload, FlowTemplate};
pub use tuple::{FlowKey, FullTuple};
pub use udp::{MsgBuffer, TxFrame, UdpFlow, MAX_FRAME_SIZE};

#[cfg(test)]
pub(crate) mod testutil {
    use bytes::Bytes;

    use crate::{FlowEnv, FlowKey, FullTuple, RstInfo, TcpFlow};

    /// Recording environment for tests: every hook call is captured.
    #[derive(Debug, Default)]
    pub struct TestEnv {
        pub tcp_inputs: usize,
        pub listens: usize,
        pub rsts: Vec<RstInfo>,
        pub closed: Vec<FlowKey>,
        pub redirects: usize,
        pub udp_payloads: Vec<(FlowKey, Bytes)>,
        /// Makes the fake TCP machine report CLOSED on the next segment.
        pub close_on_input: bool,
    }

    impl FlowEnv for TestEnv {
        fn tcp_flow_input(&mut self, flow: &mut TcpFlow, _frame: &Bytes, _ftuple: &FullTuple) {
            self.tcp_inputs += 1;
            if self.close_on_input {
                flow.set_can_close();
            }
        }

        fn tcp_listen(&mut self, _flow: &mut TcpFlow) {
            self.listens += 1;
        }

        fn tcp_respond_rst(&mut self, rst: RstInfo) {
            self.rsts.push(rst);
        }

        fn on_flow_close(&mut self, key: FlowKey) {
            self.closed.push(key);
        }

        fn on_redirect(&mut self, _frame: &Bytes) {
            self.redirects += 1;
        }

        fn on_udp_payload(&mut self, key: FlowKey, payload: Bytes) {
            self.udp_payloads.push((key, payload));
        }
    }
}
