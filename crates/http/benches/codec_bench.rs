use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio_util::codec::Decoder;
use troika_http::codec::{RequestDecoder, ResponseEncoder};
use troika_http::protocol::Response;

const SIMPLE_GET: &[u8] = b"GET /hello HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nUser-Agent: bench/0.1\r\nAccept: */*\r\n\r\n";

const CHUNKED_POST: &[u8] =
    b"POST /echo HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

fn bench_decode_simple_get(c: &mut Criterion) {
    c.bench_function("decode_simple_get", |b| {
        let mut decoder = RequestDecoder::new();
        b.iter(|| {
            let mut buf = BytesMut::from(SIMPLE_GET);
            let request = decoder.decode(&mut buf).unwrap().unwrap();
            black_box(request);
        })
    });
}

fn bench_decode_chunked_post(c: &mut Criterion) {
    c.bench_function("decode_chunked_post", |b| {
        let mut decoder = RequestDecoder::new();
        b.iter(|| {
            let mut buf = BytesMut::from(CHUNKED_POST);
            let request = decoder.decode(&mut buf).unwrap().unwrap();
            black_box(request);
        })
    });
}

fn bench_encode_response(c: &mut Criterion) {
    c.bench_function("encode_response", |b| {
        let mut encoder = ResponseEncoder::new();
        b.iter(|| {
            let response = Response::ok().with_body("hello world");
            let mut dst = BytesMut::with_capacity(256);
            encoder.encode_response(response, &mut dst).unwrap();
            black_box(dst);
        })
    });
}

criterion_group!(benches, bench_decode_simple_get, bench_decode_chunked_post, bench_encode_response);
criterion_main!(benches);
