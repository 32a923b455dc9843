//! Starts all three engines side by side on neighboring ports, serving the
//! same routes, so their behavior under load can be compared directly:
//!
//! ```bash
//! cargo run --example three_engines
//! curl -i http://127.0.0.1:8081/hello     # thread-per-connection
//! curl -i http://127.0.0.1:8082/hello     # hybrid reactor+pool
//! curl -i http://127.0.0.1:8083/hello     # single-threaded event loop
//! ```

use std::time::Duration;

use troika_engine::router::Router;
use troika_engine::{
    handler_fn, logging, run_on_worker, Engine, EngineConfig, HrpEngine, Request, Response, StelEngine, TpcEngine,
};

fn build_router() -> Router {
    Router::builder()
        .get("/hello", handler_fn(|_req| Response::ok().with_body("hello\n")))
        .post("/echo", handler_fn(|req: Request| Response::ok().with_body(req.body().clone())))
        .get(
            "/fib/{n:[0-9]+}",
            handler_fn(|req: Request| {
                // CPU-bound work goes through the worker gate so the STEL
                // reactor never runs it inline
                let n: u64 = req.path_param("n").and_then(|v| v.parse().ok()).unwrap_or(0);
                run_on_worker(&req, move || Ok(Response::ok().with_body(format!("{}\n", fib(n.min(40))))))
            }),
        )
        .build()
        .expect("router construction failed")
}

fn fib(n: u64) -> u64 {
    match n {
        0 | 1 => n,
        _ => fib(n - 1) + fib(n - 2),
    }
}

fn main() {
    logging::init();

    let mut tpc = TpcEngine::new(build_router(), EngineConfig::new(8081).with_bind_address("127.0.0.1"));
    let mut hrp =
        HrpEngine::new(build_router(), EngineConfig::new(8082).with_bind_address("127.0.0.1").with_pool_adaptive(true));
    let mut stel = StelEngine::new(build_router(), EngineConfig::new(8083).with_bind_address("127.0.0.1"));

    tpc.start().expect("tpc failed to start");
    hrp.start().expect("hrp failed to start");
    stel.start().expect("stel failed to start");

    println!("tpc  listening on http://{}", tpc.local_addr().expect("running"));
    println!("hrp  listening on http://{}", hrp.local_addr().expect("running"));
    println!("stel listening on http://{}", stel.local_addr().expect("running"));

    loop {
        std::thread::sleep(Duration::from_secs(30));
        for (name, engine) in
            [("tpc", &tpc as &dyn Engine), ("hrp", &hrp as &dyn Engine), ("stel", &stel as &dyn Engine)]
        {
            let snapshot = engine.metrics();
            println!(
                "{name}: {} requests, {} connections, {} bytes out",
                snapshot.requests_completed, snapshot.connections_accepted, snapshot.bytes_written
            );
        }
    }
}
