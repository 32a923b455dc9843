//! Minimal server on the hybrid reactor+pool engine.
//!
//! ```bash
//! cargo run --example hello_world
//! curl -i http://127.0.0.1:8080/hello
//! curl -i http://127.0.0.1:8080/users/42
//! ```

use std::time::Duration;

use troika_engine::router::Router;
use troika_engine::{handler_fn, logging, Engine, EngineConfig, HrpEngine, Request, Response};

fn main() {
    logging::init();

    let router = Router::builder()
        .get("/hello", handler_fn(|_req| Response::ok().with_body("Hello, World!\n")))
        .get(
            "/users/{id}",
            handler_fn(|req: Request| {
                let id = req.path_param("id").unwrap_or("unknown").to_string();
                Response::ok().with_body(format!("user {id}\n"))
            }),
        )
        .build()
        .expect("router construction failed");

    let config = EngineConfig::new(8080).with_bind_address("127.0.0.1");
    let mut engine = HrpEngine::new(router, config);
    engine.start().expect("engine failed to start");

    println!("listening on http://{}", engine.local_addr().expect("engine is running"));
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
