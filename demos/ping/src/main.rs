//! Minimal demonstration of a nil-call round trip: a `Ping` object that
//! echoes back `request + 1`, served and called from the same process
//! over a real loopback TCP connection. Stands in for what a generated
//! proxy/stub pair would otherwise provide.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use orb::{
  AcceptorConfig, ClientTuning, CmdItemPool, ObjectHandler, ObjectId, ObjectRegistry, OrbError, ServerTarget, WireAcceptor, WorkerPool,
};

struct PingHandler;

impl ObjectHandler for PingHandler {
  fn dispatch(&self, payload: &[u8]) -> Result<Vec<u8>, OrbError> {
    let request = u32::from_le_bytes(payload.try_into().map_err(|_| OrbError::BadFrame("ping body must be 4 bytes".into()))?);
    Ok((request + 1).to_le_bytes().to_vec())
  }
}

fn main() {
  tracing_subscriber::fmt::init();

  let ping_id = ObjectId::new(0xA5A5_A5A5_A5A5_A5A5_A5A5_A5A5_A5A5_A5A5, 1);
  let registry = Arc::new(ObjectRegistry::new());
  registry.register(ping_id, Arc::new(PingHandler)).expect("ping object registers once");

  let worker_pool = Arc::new(WorkerPool::new(registry));
  let acceptor = WireAcceptor::bind("127.0.0.1:0", AcceptorConfig::default()).expect("bind demo listener");
  let addr = format!("127.0.0.1:{}", acceptor.local_addr().unwrap().port());
  let server_pool = worker_pool.clone();
  let server_thread = thread::spawn(move || acceptor.serve(server_pool));

  let cmd_pool = Arc::new(CmdItemPool::new());
  let (target, _spooler_thread) = ServerTarget::connect(addr, cmd_pool.clone(), ClientTuning::default(), None).expect("connect to demo server");

  for request in 0..5u32 {
    let (item, rx) = cmd_pool.reserve(36).expect("reserve a command item");
    item.with_output(|buf| {
      buf.extend_from_slice(&ping_id.interface_hash().to_le_bytes());
      buf.extend_from_slice(&ping_id.instance_hash().to_le_bytes());
      buf.extend_from_slice(&request.to_le_bytes());
    });
    let outcome = match target.queue(item.clone()) {
      Ok(_) => rx.recv().unwrap_or_else(|_| Err(OrbError::Internal("waiter dropped".into()))),
      Err(e) => Err(e),
    };
    cmd_pool.release(&item);

    match outcome {
      Ok(payload) => {
        let reply = u32::from_le_bytes(payload.try_into().unwrap());
        println!("ping({request}) -> {reply}");
      }
      Err(error) => println!("ping({request}) failed: {error}"),
    }
  }

  target.request_shutdown();
  drop(server_thread); // the acceptor's thread runs for the process lifetime in this demo
  thread::sleep(Duration::from_millis(50));
}
