//! Full data-plane scenarios wiring the flow tables, the timer wheel and
//! the rx-check engine together.

use bytes::{Bytes, BytesMut};
use tgen::{
    Flow, FlowContext, FlowEnv, FlowKey, FlowTable, FlowTemplate, FullTuple, MsgBuffer, RstInfo,
    RxCheckEngine, RxMarker, RxMeta, TcpFlow, PROTO_UDP,
};

/// Records every hook call; stands in for the TCP engine and the
/// application layer.
#[derive(Debug, Default)]
struct RecordEnv {
    rsts: Vec<RstInfo>,
    closed: Vec<FlowKey>,
    redirects: usize,
    payloads: Vec<(FlowKey, Bytes)>,
}

impl FlowEnv for RecordEnv {
    fn tcp_flow_input(&mut self, _flow: &mut TcpFlow, _frame: &Bytes, _ftuple: &FullTuple) {}
    fn tcp_listen(&mut self, _flow: &mut TcpFlow) {}

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
        self.payloads.push((key, payload));
    }
}

fn send_udp(
    table: &mut FlowTable,
    ctx: &mut FlowContext,
    key: FlowKey,
    payload: &'static [u8],
) -> Bytes {
    let Some(Flow::Udp(f)) = table.get_mut(&key) else {
        panic!("udp flow {key:?} not in table");
    };
    let buf = MsgBuffer::from_bytes(Bytes::from_static(payload));
    f.send_pkt(ctx, &buf).expect("payload fits one frame").to_bytes()
}

#[test]
fn udp_request_response_between_sides() {
    let mut client = FlowTable::new(64, true);
    let mut server = FlowTable::new(64, false);
    server.set_server_template(53, PROTO_UDP, 0);

    let mut client_ctx = FlowContext::new();
    let mut server_ctx = FlowContext::new();
    let mut env = RecordEnv::default();

    // active open on the client side
    let template = FlowTemplate::new(0x1000_0001, 0x3000_0001, 1025, 53, 0, PROTO_UDP, false, 0);
    let client_key = client.open_udp_flow(&mut client_ctx, template).expect("table has room");

    // client -> server: the server table originates a flow from the packet
    let query = send_udp(&mut client, &mut client_ctx, client_key, b"query");
    server.rx_handle_packet(&mut server_ctx, &mut env, &query, RxMeta::default());

    assert_eq!(server.len(), 1);
    assert_eq!(server_ctx.udp_stats.accepts, 1);
    assert_eq!(env.payloads.len(), 1);
    assert_eq!(&env.payloads[0].1[..], b"query");
    let server_key = env.payloads[0].0;
    assert_eq!(server_key, FlowKey::new(0x1000_0001, 1025, PROTO_UDP, true));

    // server -> client: the response hits the client flow, no origination
    let response = send_udp(&mut server, &mut server_ctx, server_key, b"answer");
    client.rx_handle_packet(&mut client_ctx, &mut env, &response, RxMeta::default());

    assert_eq!(client.len(), 1);
    assert_eq!(env.payloads.len(), 2);
    assert_eq!(&env.payloads[1].1[..], b"answer");
    assert_eq!(client.stats().total_err(), 0);
    assert_eq!(server.stats().total_err(), 0);

    // both sides idle out through their keepalives
    client.handle_tick(&mut client_ctx, &mut env, 1_000.0);
    client.handle_tick(&mut client_ctx, &mut env, 2_000.0);
    server.handle_tick(&mut server_ctx, &mut env, 1_000.0);
    server.handle_tick(&mut server_ctx, &mut env, 2_000.0);
    assert_eq!(client.len(), 0);
    assert_eq!(server.len(), 0);
    assert_eq!(client_ctx.udp_stats.keepdrops, 1);
    assert_eq!(server_ctx.udp_stats.keepdrops, 1);
    assert_eq!(env.closed.len(), 2);
}

#[test]
fn markers_verify_interleaved_flows() {
    let mut engine = RxCheckEngine::new();

    // three interleaved flows, ten packets each, all in order
    for pkt_id in 0..10u16 {
        for flow_id in [100u64, 200, 300] {
            let mut m = RxMarker::new(flow_id);
            m.pkt_id = pkt_id;
            m.flow_size = 10;
            m.aging_sec = 10;
            engine.handle_packet(&m, 1.0);
        }
    }

    assert_eq!(engine.stats().total_err(), 0);
    assert_eq!(engine.stats().add, 3);
    assert_eq!(engine.stats().remove, 3);
    assert_eq!(engine.active_flows(), 0);
    assert_eq!(engine.total_rx(), 30);
}

#[test]
fn marker_survives_frame_encode_decode() {
    // a marker embedded behind a frame header still verifies
    let mut m = RxMarker::new(42);
    m.pkt_id = 0;
    m.flow_size = 1;
    m.aging_sec = 5;
    m.template_id = 2;
    m.time_stamp = tgen::unix_micros() as u32;

    let mut frame = BytesMut::from(&[0u8; 34][..]); // headers
    m.encode(&mut frame);
    let frame = frame.freeze();

    let decoded = RxMarker::decode(&frame[34..]).expect("marker fits");
    let mut engine = RxCheckEngine::new();
    engine.handle_packet(&decoded, 0.5);
    engine.add_rx_bytes(frame.len() as u64);

    assert_eq!(engine.stats().total_err(), 0);
    assert_eq!(engine.stats().remove, 1);
    assert_eq!(engine.stats().total_rx_bytes, frame.len() as u64);
    assert_eq!(engine.template(2).rx_pkts(), 1);
}

#[test]
fn many_flows_age_out_together() {
    let mut table = FlowTable::new(1024, true);
    let mut ctx = FlowContext::new();
    let mut env = RecordEnv::default();

    for i in 0..100u32 {
        let t = FlowTemplate::new(0x0a00_0000 + i, 2, 1024, 53, 0, PROTO_UDP, false, 0);
        table.open_udp_flow(&mut ctx, t).expect("distinct tuples");
    }
    assert_eq!(table.len(), 100);
    assert_eq!(ctx.tw.len(), 100);

    table.handle_tick(&mut ctx, &mut env, 10_000.0);
    assert_eq!(table.len(), 0);
    assert_eq!(ctx.udp_stats.keepdrops, 100);
    assert_eq!(env.closed.len(), 100);
    assert!(ctx.tw.is_empty());
}
