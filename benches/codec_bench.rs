use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use mqtt_cluster_proxy::core::codec::{encode, parse, MqttCodec};
use mqtt_cluster_proxy::core::message::{Connect, Message, QoS, Subscription};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_publish_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Message::publish("sensors/room/1", vec![0u8; size], QoS::AtLeastOnce, 42),
                |message| {
                    let mut buf = BytesMut::with_capacity(size + 32);
                    let mut codec = MqttCodec::new();
                    codec.encode(message, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let bytes = encode(&Message::publish(
            "sensors/room/1",
            vec![0u8; size],
            QoS::AtLeastOnce,
            42,
        ))
        .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter(|| {
                let decoded = parse(&bytes);
                assert!(decoded.is_ok());
            })
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_control_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_messages");
    let messages = vec![
        Message::connect(Connect::new("bench-client", false, 60).with_credentials("user", Some("pw"))),
        Message::subscribe(
            1,
            vec![Subscription {
                topic: "a/+/c".into(),
                qos: QoS::AtLeastOnce,
            }],
        ),
        Message::puback(7),
        Message::pingreq(),
    ];

    group.bench_function("encode", |b| {
        b.iter(|| {
            for message in &messages {
                let _ = encode(message).unwrap();
            }
        })
    });

    let mut stream = BytesMut::new();
    let mut codec = MqttCodec::new();
    for message in &messages {
        codec.encode(message.clone(), &mut stream).unwrap();
    }
    group.bench_function("stream_decode", |b| {
        b.iter_batched(
            || stream.clone(),
            |mut buf| {
                let mut codec = MqttCodec::new();
                while let Some(message) = codec.decode(&mut buf).unwrap() {
                    let _ = message;
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_publish_encode_decode, bench_control_messages);
criterion_main!(benches);
