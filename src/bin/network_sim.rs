//! Network Server Simulator
//!
//! Listens for Semtech PUSH_DATA from lds-bridge, ACKs it, and answers each
//! uplink with a PULL_RESP that echoes the payload back as a downlink.
//! Useful for testing the bridge without a real network server.
//!
//! Usage: cargo run --bin network-sim [listen_addr] [gateway_port]
//!
//! The PULL_RESP goes to the uplink's source IP on `gateway_port`, where the
//! bridge's listener is bound.

use std::env;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use lds_bridge::udp::protocol::{
    decode_push_data, encode_pull_resp, push_ack, DataRate, PullResponse, Txpk,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let listen_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:1700".to_string())
        .parse()?;
    let gateway_port: u16 = env::args()
        .nth(2)
        .unwrap_or_else(|| "1700".to_string())
        .parse()?;

    let socket = UdpSocket::bind(listen_addr).await?;
    println!("📡 Network Server Simulator");
    println!("  Listening: {}", listen_addr);
    println!("  Downlinks to gateway port {}", gateway_port);
    println!();

    let mut buf = vec![0u8; 65535];
    let mut token: u16 = 0;

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;

        let (random_token, gateway, body) = match decode_push_data(&buf[..len]) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("⚠️  Ignoring {} bytes from {}: {}", len, src, e);
                continue;
            }
        };

        println!("⬆️  PUSH_DATA from gateway {} (token: 0x{:04x})", gateway, random_token);
        socket.send_to(&push_ack(random_token), src).await?;

        for rxpk in &body.rxpk {
            println!(
                "   rxpk: freq={} MHz, rssi={} dBm, datr={}, size={} bytes",
                rxpk.freq, rxpk.rssi, rxpk.datr, rxpk.size
            );

            let payload = match rxpk.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    println!("   ❌ Bad rxpk data: {}", e);
                    continue;
                }
            };
            println!("   PHY: {}", hex::encode(&payload));

            token = token.wrapping_add(1);
            let response = PullResponse {
                txpk: Some(Txpk {
                    imme: Some(true),
                    freq: Some(rxpk.freq),
                    rfch: Some(0),
                    powe: Some(14),
                    modu: Some("LORA".to_string()),
                    datr: Some(DataRate::Lora(rxpk.datr.clone())),
                    codr: Some(rxpk.codr.clone()),
                    ipol: Some(true),
                    size: Some(rxpk.size),
                    data: rxpk.data.clone(),
                    ..Default::default()
                }),
            };
            let datagram = encode_pull_resp(token, &response)?;
            let gateway_addr = SocketAddr::new(src.ip(), gateway_port);
            socket.send_to(&datagram, gateway_addr).await?;
            println!("   ⬇️  PULL_RESP sent to {} (token: 0x{:04x})", gateway_addr, token);
        }
        println!();
    }
}
