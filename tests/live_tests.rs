/***
* These tests need to be run as root, on Linux, with libpcap installed.
*
* To build and run these tests, run:
*

 cargo test --no-run --test live_tests |& \
           sed -e 's/[()]//g' | \
           awk '/Executable/ {print $3" --include-ignored"}' | \
           xargs sudo

* which does the build as a non-priv user, extracts the exec binary location of
* the test from 'cargo test', and runs only that as root.
*
* Traffic is generated with UDP sockets on the loopback interface, filtered to a port
* nothing else should be using.
*/

#[cfg(target_os = "linux")]
mod live {
    use std::{
        net::UdpSocket,
        thread,
        time::{Duration, Instant},
    };

    use etherparse::{PacketHeaders, TransportHeader};
    use tempfile::TempDir;

    use packetdump::{
        dump, Capture, CaptureConfig, Error, LibpcapProvider, Linktype, Provider,
        SavefileReader, StopToken,
    };

    const PORT: u16 = 45123;

    fn provider() -> &'static LibpcapProvider {
        let provider = LibpcapProvider::shared();
        if let Some(e) = provider.load_error() {
            panic!("libpcap is required for these tests: {e}");
        }
        provider
    }

    /// Sends `count` datagrams to the test port, each carrying its index.
    fn send(count: u8) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..count {
            socket.send_to(&[i; 32], ("127.0.0.1", PORT)).unwrap();
        }
    }

    fn udp_payload(data: &[u8]) -> Option<Vec<u8>> {
        let headers = PacketHeaders::from_ethernet_slice(data).ok()?;
        match headers.transport {
            Some(TransportHeader::Udp(udp)) if udp.destination_port == PORT => {
                Some(headers.payload.to_vec())
            }
            _ => None,
        }
    }

    #[test]
    #[ignore]
    fn capture_loopback_session() {
        let mut session = Capture::from_device("lo")
            .timeout(50)
            .open(provider())
            .unwrap();
        assert_eq!(session.datalink(), Linktype::ETHERNET);
        session.filter(&format!("udp port {PORT}"), true).unwrap();

        send(3);

        let mut seen = Vec::new();
        let start = Instant::now();
        while seen.len() < 3 && start.elapsed() < Duration::from_secs(5) {
            match session.next_packet() {
                Ok(packet) => {
                    assert_eq!(packet.header.caplen as usize, packet.data.len());
                    if let Some(payload) = udp_payload(packet.data) {
                        seen.push(payload[0]);
                    }
                }
                Err(Error::TimeoutExpired) => continue,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);

        let stat = session.stats_source().stats().unwrap();
        assert!(stat.received >= 3);
    }

    #[test]
    #[ignore]
    fn dump_loopback_until_stopped() {
        let dir = TempDir::new().unwrap();
        let pattern = dir.path().join("lo-%H%M%S.pcap.lz4");
        let config = CaptureConfig::builder(pattern.to_str().unwrap())
            .interface("lo")
            .bpf(format!("udp port {PORT}"))
            .timeout_ms(50)
            .build()
            .unwrap();

        let stop = StopToken::new();
        let sender = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                send(10);
                thread::sleep(Duration::from_millis(500));
                stop.request_stop();
            })
        };
        let summary = dump::run(&config, provider(), &stop).unwrap();
        sender.join().unwrap();

        assert_eq!(summary.packets, 10);
        assert_eq!(summary.files_opened, 1);

        let path = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let (_, frames) = SavefileReader::open(path).unwrap().read_all().unwrap();
        let payloads: Vec<u8> = frames
            .iter()
            .filter_map(|f| udp_payload(&f.data))
            .map(|p| p[0])
            .collect();
        assert_eq!(payloads, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    #[ignore]
    fn missing_interface_fails() {
        let err = Capture::from_device("no-such-interface0")
            .open(provider())
            .err()
            .unwrap();
        assert!(matches!(err, Error::CaptureUnavailable { .. }));
    }

    #[test]
    fn provider_reports_version() {
        let provider = LibpcapProvider::shared();
        if provider.is_available() {
            assert!(provider.version().unwrap().contains("libpcap"));
        }
    }
}
