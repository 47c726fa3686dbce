//! End-to-end transfer between two ranks of one process: kernel-side setup
//! and connect through the transport engine, then a 4-step SIMPLE payload
//! pushed through the socket provider, with this test playing both GPU
//! kernels against the FIFO words.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver};

use ccnet::comm::{CommProfile, CommunicatorId, PeerInfo};
use ccnet::device::sysmem::SYSMEM_DEVICE;
use ccnet::device::sysmem::SysmemDevice;
use ccnet::transport::catalog::TransportCatalog;
use ccnet::transport::channel::{ChannelId, ConnType, PeerConnId, PeerConnInfo};
use ccnet::transport::engine::{TransportEngine, TransportEngineId};
use ccnet::transport::message::{TransportEngineReply, TransportEngineRequest};
use ccnet::transport::net::config::NetTransportConfig;
use ccnet::transport::net::provider::socket::SOCKET_TRANSPORT;
use ccnet::transport::net::provider::NetProviderWrap;
use ccnet::transport::net::transporter::NET_TRANSPORT;
use ccnet::transport::op::{TransportOp, TransportSubOp};
use ccnet::transport::transporter::{
    AgentMessage, AnyResources, ConnectHandle, TransportAgentId, TransportConnect, TransportSetup,
    Transporter,
};
use ccnet::transport::{Protocol, NUM_PROTOCOLS};

const NUM_STEPS: u64 = 4;
const BUFF_SIZES: [usize; NUM_PROTOCOLS] = [16384, 32768, 65536];

fn test_profile() -> CommProfile {
    let device: &'static SysmemDevice = &SYSMEM_DEVICE;
    let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let pid = std::process::id();
    CommProfile {
        buff_sizes: BUFF_SIZES,
        p2p_chunk_size: 4096,
        p2p_num_channels: 1,
        num_local_ranks: 2,
        collective_graph: true,
        alloc_p2p_net_ll_buffers: false,
        channel_net_devices: Vec::new(),
        pxn_proxy_ranks: Vec::new(),
        gdr_read: false,
        gdr_write: false,
        gdr_need_flush: false,
        intra_node_net: true,
        peers: vec![
            PeerInfo {
                rank: 0,
                local_rank: 0,
                host,
                pid,
                cuda_device_idx: 0,
            },
            PeerInfo {
                rank: 1,
                local_rank: 1,
                host,
                pid,
                cuda_device_idx: 0,
            },
        ],
        provider: &SOCKET_TRANSPORT,
        device,
    }
}

fn agent_id(conn: PeerConnId, client_rank: usize) -> TransportAgentId {
    TransportAgentId {
        communicator_id: CommunicatorId(7),
        client_rank,
        client_cuda_dev: 0,
        peer_conn: conn,
    }
}

fn wait_reply(engine: &mut TransportEngine, rx: &Receiver<TransportEngineReply>) -> TransportEngineReply {
    for _ in 0..1000 {
        engine.mainloop();
        if let Ok(reply) = rx.try_recv() {
            return reply;
        }
    }
    panic!("engine produced no reply");
}

fn setup_reply(reply: TransportEngineReply) -> AgentMessage {
    match reply {
        TransportEngineReply::AgentSetup(_, msg) => msg,
        TransportEngineReply::AgentError(_, err) => panic!("agent setup failed: {err}"),
        _ => panic!("unexpected reply"),
    }
}

fn connect_reply(reply: TransportEngineReply) -> AgentMessage {
    match reply {
        TransportEngineReply::AgentConnect(_, msg) => msg,
        TransportEngineReply::AgentError(_, err) => panic!("agent connect failed: {err}"),
        _ => panic!("unexpected reply"),
    }
}

fn pre_agent_setup(setup: TransportSetup) -> (AgentMessage, Option<AnyResources>) {
    match setup {
        TransportSetup::PreAgentCb {
            agent_request,
            setup_resources,
            ..
        } => (agent_request, setup_resources),
        TransportSetup::Setup { .. } => panic!("expected an agent round"),
    }
}

fn setup_handle(setup: TransportSetup) -> (ConnectHandle, Option<AnyResources>) {
    match setup {
        TransportSetup::Setup {
            peer_connect_handle,
            setup_resources,
        } => (peer_connect_handle, setup_resources),
        TransportSetup::PreAgentCb { .. } => panic!("expected a finished setup"),
    }
}

fn pre_agent_connect(connect: TransportConnect) -> (AgentMessage, Option<AnyResources>) {
    match connect {
        TransportConnect::PreAgentCb {
            agent_request,
            transport_resources,
        } => (agent_request, transport_resources),
        TransportConnect::Connect { .. } => panic!("expected an agent round"),
    }
}

fn connected(connect: TransportConnect) -> (PeerConnInfo, AnyResources) {
    match connect {
        TransportConnect::Connect {
            conn_info,
            transport_resources,
        } => (conn_info, transport_resources),
        TransportConnect::PreAgentCb { .. } => panic!("expected a finished connect"),
    }
}

#[test]
fn simple_transfer_over_socket_provider() {
    let _ = env_logger::builder().is_test(true).try_init();
    let provider: &'static dyn NetProviderWrap = &SOCKET_TRANSPORT;
    provider.init().unwrap();

    let profile = test_profile();
    let catalog = Arc::new(TransportCatalog::new());
    catalog.register_config(
        "NetTransport".to_string(),
        NetTransportConfig {
            gdr_enable: false,
            ..Default::default()
        },
    );

    let (reply_tx, reply_rx) = unbounded();
    let (request_tx, request_rx) = unbounded();
    let mut engine = TransportEngine::new(
        TransportEngineId {
            cuda_device_idx: 0,
            index: 0,
        },
        Arc::clone(&catalog),
        vec![reply_tx],
        vec![request_rx],
    );

    let send_conn = PeerConnId {
        peer_rank: 1,
        channel: ChannelId(0),
        conn_index: 0,
        conn_type: ConnType::Send,
    };
    let recv_conn = PeerConnId {
        peer_rank: 0,
        channel: ChannelId(0),
        conn_index: 0,
        conn_type: ConnType::Recv,
    };
    let send_agent = agent_id(send_conn, 0);
    let recv_agent = agent_id(recv_conn, 1);

    // Setup rounds on both sides.
    let setup = NET_TRANSPORT
        .send_setup(&send_conn, &profile.peers[0], &profile.peers[1], &profile, &catalog)
        .unwrap();
    let (send_request, send_setup_resources) = pre_agent_setup(setup);
    request_tx
        .send(TransportEngineRequest::AgentSetup(
            &NET_TRANSPORT,
            send_agent,
            send_request,
        ))
        .unwrap();
    let send_setup_reply = setup_reply(wait_reply(&mut engine, &reply_rx));
    let setup = NET_TRANSPORT
        .send_setup_agent_callback(0, &send_conn, send_setup_reply, send_setup_resources)
        .unwrap();
    let (send_info_blob, send_setup_resources) = setup_handle(setup);

    let setup = NET_TRANSPORT
        .recv_setup(&recv_conn, &profile.peers[1], &profile.peers[0], &profile, &catalog)
        .unwrap();
    let (recv_request, recv_setup_resources) = pre_agent_setup(setup);
    request_tx
        .send(TransportEngineRequest::AgentSetup(
            &NET_TRANSPORT,
            recv_agent,
            recv_request,
        ))
        .unwrap();
    let recv_setup_reply = setup_reply(wait_reply(&mut engine, &reply_rx));
    let setup = NET_TRANSPORT
        .recv_setup_agent_callback(1, &recv_conn, recv_setup_reply, recv_setup_resources)
        .unwrap();
    let (recv_info_blob, _) = setup_handle(setup);

    // Connect: the sender dials the receiver's listen handle first, then the
    // receiver accepts.
    let connect = NET_TRANSPORT
        .send_connect(&send_conn, recv_info_blob, send_setup_resources)
        .unwrap();
    let (send_request, send_transport_resources) = pre_agent_connect(connect);
    request_tx
        .send(TransportEngineRequest::AgentConnect(
            &NET_TRANSPORT,
            send_agent,
            send_request,
        ))
        .unwrap();
    let send_connect_reply = connect_reply(wait_reply(&mut engine, &reply_rx));

    let connect = NET_TRANSPORT
        .recv_connect(&recv_conn, send_info_blob, None)
        .unwrap();
    let (recv_request, _) = pre_agent_connect(connect);
    request_tx
        .send(TransportEngineRequest::AgentConnect(
            &NET_TRANSPORT,
            recv_agent,
            recv_request,
        ))
        .unwrap();
    let recv_connect_reply = connect_reply(wait_reply(&mut engine, &reply_rx));

    let connect = NET_TRANSPORT
        .send_connect_agent_callback(&send_conn, send_connect_reply, send_transport_resources)
        .unwrap();
    let (send_info, _send_resources) = connected(connect);
    let connect = NET_TRANSPORT
        .recv_connect_agent_callback(&recv_conn, recv_connect_reply, None)
        .unwrap();
    let (recv_info, _recv_resources) = connected(connect);

    let step_size = BUFF_SIZES[Protocol::Simple as usize] / ccnet::transport::NUM_BUFFER_SLOTS;
    let send_buf = send_info.bufs[Protocol::Simple as usize].unwrap().as_ptr();
    let recv_buf = recv_info.bufs[Protocol::Simple as usize].unwrap().as_ptr();

    // The sending kernel stages all four steps and publishes them.
    unsafe {
        for step in 0..NUM_STEPS {
            let pattern = 0x10 + step as u8;
            std::ptr::write_bytes(send_buf.add(step as usize * step_size), pattern, step_size);
            send_info
                .slots_sizes
                .as_ptr()
                .add(step as usize)
                .write_volatile(step_size as i32);
        }
        send_info.tail.as_ptr().write_volatile(NUM_STEPS);
    }

    // Queue both progress ops.
    let send_op = TransportOp::new(
        CommunicatorId(7),
        Protocol::Simple,
        1,
        1,
        vec![TransportSubOp::new(send_agent, NUM_STEPS, NUM_STEPS as usize * step_size)],
    );
    let recv_op = TransportOp::new(
        CommunicatorId(7),
        Protocol::Simple,
        1,
        1,
        vec![TransportSubOp::new(recv_agent, NUM_STEPS, NUM_STEPS as usize * step_size)],
    );
    request_tx
        .send(TransportEngineRequest::AgentTransportOp(send_agent, send_op))
        .unwrap();
    request_tx
        .send(TransportEngineRequest::AgentTransportOp(recv_agent, recv_op))
        .unwrap();

    // The receiving kernel consumes steps as the proxy publishes the tail,
    // releasing slots through the head word.
    let mut consumed = 0u64;
    for _ in 0..100_000 {
        engine.mainloop();
        let tail = unsafe { recv_info.tail.as_ptr().read_volatile() };
        while consumed < tail {
            let slot = consumed as usize;
            let pattern = 0x10 + consumed as u8;
            let payload =
                unsafe { std::slice::from_raw_parts(recv_buf.add(slot * step_size), step_size) };
            assert!(payload.iter().all(|&b| b == pattern));
            consumed += 1;
            unsafe { recv_info.head.as_ptr().write_volatile(consumed) };
        }
        let send_head = unsafe { send_info.head.as_ptr().read_volatile() };
        if consumed == NUM_STEPS && send_head == NUM_STEPS {
            break;
        }
    }
    assert_eq!(consumed, NUM_STEPS);
    assert_eq!(unsafe { send_info.head.as_ptr().read_volatile() }, NUM_STEPS);

    // Tear both connections down through the engine.
    request_tx
        .send(TransportEngineRequest::AgentFree(send_agent))
        .unwrap();
    request_tx
        .send(TransportEngineRequest::AgentFree(recv_agent))
        .unwrap();
    let mut freed = 0;
    while freed < 2 {
        match wait_reply(&mut engine, &reply_rx) {
            TransportEngineReply::AgentFree(_) => freed += 1,
            TransportEngineReply::AgentError(_, err) => panic!("free failed: {err}"),
            _ => panic!("unexpected reply"),
        }
    }
}
