#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mqtt_cluster_proxy::core::codec::MqttCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Feed the streaming decoder in two pieces at an arbitrary split point
    if data.is_empty() {
        return;
    }
    let split = data[0] as usize % data.len();
    let mut codec = MqttCodec::with_max_remaining_length(64 * 1024);
    let mut buf = BytesMut::from(&data[1..split.max(1)]);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    buf.extend_from_slice(&data[split.max(1)..]);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
