//! Loopback sessions: a fake client and a fake remote server on real
//! sockets, with the proxy in between.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use shipgate_proxy::cipher::block::{BlockCipher, BlockKey};
use shipgate_proxy::cipher::stream::StreamCipher;
use shipgate_proxy::cipher::PacketCipher;
use shipgate_proxy::frame::{encode_frame, Frame, FrameReader};
use shipgate_proxy::proxy::ProxyServer;
use shipgate_proxy::services::{
    License, PortDirectory, Services, StaticKeyPalette, StaticLicenseAuthority,
};
use shipgate_proxy::version::GameVersion;
use shipgate_proxy::wire;

const SERIAL: u32 = 0x1234_5678;
const REMOTE_GC: u32 = 7_777_777;

fn test_services(keys: Vec<Arc<BlockKey>>) -> Services {
    Services {
        name: "Alembic".into(),
        licenses: Arc::new(StaticLicenseAuthority::new(vec![License {
            serial_number: SERIAL,
            access_key: "abcdefgh".into(),
            password: "gcpw".into(),
            username: "user".into(),
        }])),
        keys: Arc::new(StaticKeyPalette::new(keys)),
        ports: PortDirectory::default(),
        save_dir: std::env::temp_dir(),
        disassembler: None,
    }
}

async fn read_frame(
    sock: &mut TcpStream,
    reader: &mut FrameReader,
    mut cipher: Option<&mut dyn PacketCipher>,
) -> Frame {
    let mut buf = [0u8; 4096];
    loop {
        let next = match &mut cipher {
            Some(c) => reader.next_frame(Some(&mut **c)),
            None => reader.next_frame(None),
        };
        if let Some(frame) = next.expect("frame decode") {
            return frame;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "peer closed early");
        reader.feed(&buf[..n]);
    }
}

fn desktop_login_payload() -> Vec<u8> {
    let mut p = vec![0u8; wire::LOGIN_V2_SIZE];
    wire::write_u32_at(&mut p, 0, 0xFFFF_0000);
    wire::write_u32_at(&mut p, 4, 0xFFFF_FFFF);
    wire::write_u32_at(&mut p, 0x10, 0x29); // sub_version
    p[0x18..0x20].copy_from_slice(b"12345678");
    p[0x28..0x30].copy_from_slice(b"abcdefgh");
    p[0x38..0x40].copy_from_slice(b"12345678");
    p[0x48..0x50].copy_from_slice(b"abcdefgh");
    p[0x58..0x5C].copy_from_slice(b"Rico");
    p
}

/// A desktop client behind the proxy keeps seeing its own serial number
/// while the remote server sees its own assignment.
#[tokio::test]
async fn pc_session_masks_remote_identity() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = match remote.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        _ => unreachable!(),
    };

    let proxy = ProxyServer::new(test_services(vec![]));
    let port = proxy
        .listen(0, GameVersion::Pc, Some(remote_addr))
        .await
        .unwrap();

    let remote_task = tokio::spawn(async move {
        let (mut sock, _) = remote.accept().await.unwrap();
        let server_seed = 0xAABB_0001u32;
        let client_seed = 0xCCDD_0002u32;
        let init = Frame::new(0x02, 0, wire::build_server_init_v2(false, server_seed, client_seed));
        sock.write_all(&encode_frame(GameVersion::Pc, &init, None).unwrap())
            .await
            .unwrap();

        let mut dec = StreamCipher::new(client_seed);
        let mut enc = StreamCipher::new(server_seed);
        let mut reader = FrameReader::new(GameVersion::Pc);

        // The proxy logs in on the client's behalf.
        let login = read_frame(&mut sock, &mut reader, Some(&mut dec)).await;
        assert_eq!(login.opcode, 0x9D);
        assert_eq!(&login.payload[0x18..0x20], b"12345678");

        // Assign a guild card number.
        let mut p = vec![0u8; 0x28];
        wire::write_u32_at(&mut p, 4, REMOTE_GC);
        let assign = Frame::new(0x04, 0, p);
        sock.write_all(
            &encode_frame(GameVersion::Pc, &assign, Some(&mut enc)).unwrap(),
        )
        .await
        .unwrap();

        // First the faked checksum response, then the translated search.
        let checksum = read_frame(&mut sock, &mut reader, Some(&mut dec)).await;
        assert_eq!(checksum.opcode, 0x96);
        assert_eq!(checksum.payload.len(), 8);

        let search = read_frame(&mut sock, &mut reader, Some(&mut dec)).await;
        assert_eq!(search.opcode, 0x40);
        assert_eq!(wire::read_u32_at(&search.payload, 4), REMOTE_GC);
        assert_eq!(wire::read_u32_at(&search.payload, 8), REMOTE_GC);
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut reader = FrameReader::new(GameVersion::Pc);

    // The proxy greets with its own plaintext server-init.
    let welcome = read_frame(&mut client, &mut reader, None).await;
    assert_eq!(welcome.opcode, 0x02);
    let (server_seed, client_seed) = wire::parse_server_init_v2(&welcome.payload).unwrap();
    let mut enc = StreamCipher::new(client_seed);
    let mut dec = StreamCipher::new(server_seed);

    let login = Frame::new(0x9D, 0, desktop_login_payload());
    client
        .write_all(&encode_frame(GameVersion::Pc, &login, Some(&mut enc)).unwrap())
        .await
        .unwrap();

    // Announcement bubble first, then the masked 0x04.
    let bubble = read_frame(&mut client, &mut reader, Some(&mut dec)).await;
    assert_eq!(bubble.opcode, 0x11);
    let config = read_frame(&mut client, &mut reader, Some(&mut dec)).await;
    assert_eq!(config.opcode, 0x04);
    assert_eq!(wire::read_u32_at(&config.payload, 4), SERIAL);

    // Searching for ourselves by the identity we know.
    let mut p = vec![0u8; 12];
    wire::write_u32_at(&mut p, 4, SERIAL);
    wire::write_u32_at(&mut p, 8, SERIAL);
    let search = Frame::new(0x40, 0, p);
    client
        .write_all(&encode_frame(GameVersion::Pc, &search, Some(&mut enc)).unwrap())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), remote_task)
        .await
        .expect("remote side timed out")
        .unwrap();
}

/// A Bb login is captured during the unlinked phase and replayed verbatim
/// toward the remote server once its cipher setup arrives.
#[tokio::test]
async fn bb_login_is_replayed_to_the_remote_server() {
    let key = Arc::new(BlockKey::derive("retail", b"retail-table"));
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = match remote.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        _ => unreachable!(),
    };

    let proxy = ProxyServer::new(test_services(vec![key.clone()]));
    let port = proxy
        .listen(0, GameVersion::Bb, Some(remote_addr))
        .await
        .unwrap();

    // Login payload sized so the whole frame is the canonical 0xB4 bytes.
    let mut login_payload = vec![0u8; 0xAC];
    login_payload[wire::LOGIN_BB_USERNAME_OFFSET..wire::LOGIN_BB_USERNAME_OFFSET + 4]
        .copy_from_slice(b"user");
    login_payload[wire::LOGIN_BB_PASSWORD_OFFSET..wire::LOGIN_BB_PASSWORD_OFFSET + 2]
        .copy_from_slice(b"pw");
    let expected_replay = login_payload.clone();

    let remote_key = key.clone();
    let remote_task = tokio::spawn(async move {
        let (mut sock, _) = remote.accept().await.unwrap();
        let server_seed = [0x31u8; wire::BB_SEED_SIZE];
        let client_seed = [0x74u8; wire::BB_SEED_SIZE];
        let init = Frame::new(0x03, 0, wire::build_server_init_bb(&server_seed, &client_seed));
        sock.write_all(&encode_frame(GameVersion::Bb, &init, None).unwrap())
            .await
            .unwrap();

        // The proxy speaks for the client using our client seed.
        let mut dec = BlockCipher::new(&remote_key, &client_seed);
        let mut reader = FrameReader::new(GameVersion::Bb);
        let replay = read_frame(&mut sock, &mut reader, Some(&mut dec)).await;
        assert_eq!(replay.opcode, 0x93);
        assert_eq!(replay.payload, expected_replay);
    });

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut reader = FrameReader::new(GameVersion::Bb);

    let welcome = read_frame(&mut client, &mut reader, None).await;
    assert_eq!(welcome.opcode, 0x03);
    let (_server_seed, client_seed) = wire::parse_server_init_bb(&welcome.payload).unwrap();

    let mut enc = BlockCipher::new(&key, &client_seed);
    let login = Frame::new(0x93, 0, login_payload);
    let wire_bytes = encode_frame(GameVersion::Bb, &login, Some(&mut enc)).unwrap();
    assert_eq!(wire_bytes.len(), 0xB8); // 0xB4 padded to the block size
    client.write_all(&wire_bytes).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), remote_task)
        .await
        .expect("remote side timed out")
        .unwrap();
}
