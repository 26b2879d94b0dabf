//! Simulates one UDP exchange between a client and a server flow table,
//! then lets the keepalives age both flows out.

use bytes::Bytes;
use tgen::{
    Flow, FlowContext, FlowEnv, FlowKey, FlowTable, FlowTemplate, FullTuple, MsgBuffer, RstInfo,
    RxMeta, TcpFlow, PROTO_UDP,
};

#[derive(Debug, Default)]
struct EchoEnv {
    payloads: Vec<(FlowKey, Bytes)>,
}

impl FlowEnv for EchoEnv {
    fn tcp_flow_input(&mut self, _flow: &mut TcpFlow, _frame: &Bytes, _ftuple: &FullTuple) {}
    fn tcp_listen(&mut self, _flow: &mut TcpFlow) {}
    fn tcp_respond_rst(&mut self, _rst: RstInfo) {}
    fn on_flow_close(&mut self, key: FlowKey) {
        println!("flow closed: {key:?}");
    }
    fn on_redirect(&mut self, _frame: &Bytes) {}
    fn on_udp_payload(&mut self, key: FlowKey, payload: Bytes) {
        println!("payload for {key:?}: {:?}", payload);
        self.payloads.push((key, payload));
    }
}

fn main() {
    tracing_subscriber::fmt().init();

    let mut client = FlowTable::new(64, true);
    let mut server = FlowTable::new(64, false);
    server.set_server_template(53, PROTO_UDP, 0);

    let mut client_ctx = FlowContext::new();
    let mut server_ctx = FlowContext::new();
    let mut env = EchoEnv::default();

    // client actively opens a flow towards the server
    let template = FlowTemplate::new(0x0a00_0001, 0x0a00_0002, 1025, 53, 0, PROTO_UDP, false, 0);
    let client_key = client.open_udp_flow(&mut client_ctx, template).expect("fresh table");

    // client -> server
    let Some(Flow::Udp(f)) = client.get_mut(&client_key) else { unreachable!() };
    let query = f
        .send_pkt(&mut client_ctx, &MsgBuffer::from_bytes(Bytes::from_static(b"ping")))
        .expect("fits")
        .to_bytes();
    server.rx_handle_packet(&mut server_ctx, &mut env, &query, RxMeta::default());

    // server -> client: echo through the flow the server just originated
    let server_key = env.payloads[0].0;
    let Some(Flow::Udp(f)) = server.get_mut(&server_key) else { unreachable!() };
    let echo = f
        .send_pkt(&mut server_ctx, &MsgBuffer::from_bytes(env.payloads[0].1.clone()))
        .expect("fits")
        .to_bytes();
    client.rx_handle_packet(&mut client_ctx, &mut env, &echo, RxMeta::default());

    // advance time until the keepalives expire
    let t0 = tgen::now_sec();
    for now in [t0 + 100.0, t0 + 200.0] {
        client.handle_tick(&mut client_ctx, &mut env, now);
        server.handle_tick(&mut server_ctx, &mut env, now);
    }

    println!("--- client ---\n{}", client.dump());
    println!("--- server ---\n{}", server.dump());
}
