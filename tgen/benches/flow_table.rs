use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

use tgen::{
    FlowContext, FlowEnv, FlowKey, FlowTable, FlowTemplate, FullTuple, RstInfo, RxCheckEngine,
    RxMarker, RxMeta, TcpFlow, PROTO_UDP,
};

#[derive(Debug, Default)]
struct NullEnv;

impl FlowEnv for NullEnv {
    fn tcp_flow_input(&mut self, _flow: &mut TcpFlow, _frame: &Bytes, _ftuple: &FullTuple) {}
    fn tcp_listen(&mut self, _flow: &mut TcpFlow) {}
    fn tcp_respond_rst(&mut self, _rst: RstInfo) {}
    fn on_flow_close(&mut self, _key: FlowKey) {}
    fn on_redirect(&mut self, _frame: &Bytes) {}
    fn on_udp_payload(&mut self, _key: FlowKey, _payload: Bytes) {}
}

fn udp_frame(src_ip: u32, payload_len: usize) -> Bytes {
    let t = FlowTemplate::new(src_ip, 0x3000_0001, 1025, 53, 0, PROTO_UDP, false, 0);
    let udp_len = (8 + payload_len) as u16;
    let mut h: BytesMut = t.clone_and_patch(udp_len);
    let l4 = t.offset_l4();
    h[l4 + 4..l4 + 6].copy_from_slice(&udp_len.to_be_bytes());
    let mut payload = vec![0u8; payload_len];
    rand::thread_rng().fill(&mut payload[..]);
    h.extend_from_slice(&payload);
    h.freeze()
}

fn bench_rx_hit(c: &mut Criterion) {
    let mut table = FlowTable::new(1 << 16, false);
    table.set_server_template(53, PROTO_UDP, 0);
    let mut ctx = FlowContext::new();
    let mut env = NullEnv;

    let frame = udp_frame(0x0a00_0001, 64);
    // first packet originates the flow, the measured path is the hit
    table.rx_handle_packet(&mut ctx, &mut env, &frame, RxMeta::default());

    let mut group = c.benchmark_group("flow_table");
    group.throughput(Throughput::Elements(1));
    group.bench_function("rx_hit_udp", |b| {
        b.iter(|| {
            table.rx_handle_packet(
                &mut ctx,
                &mut env,
                black_box(&frame),
                RxMeta::default(),
            );
        })
    });
    group.finish();
}

fn bench_rx_check(c: &mut Criterion) {
    let mut engine = RxCheckEngine::new();
    let mut m = RxMarker::new(7);
    m.flow_size = u16::MAX;
    m.aging_sec = 3600;
    let mut pkt_id = 0u16;

    let mut group = c.benchmark_group("rx_check");
    group.throughput(Throughput::Elements(1));
    group.bench_function("handle_marker", |b| {
        b.iter(|| {
            m.pkt_id = pkt_id;
            pkt_id = pkt_id.wrapping_add(1) % (u16::MAX - 1);
            engine.handle_packet(black_box(&m), 1.0);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_rx_hit, bench_rx_check);
criterion_main!(benches);
