extern crate testimony_client;

use std::env;
use std::thread;

use testimony_client::Client;

fn worker(idx: u32, socket_path: String) {
    let mut client = match Client::connect(&socket_path, idx) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("start worker #{} failure: {}", idx, err);
            return;
        }
    };
    loop {
        match client.get_block(-1) {
            Ok(Some(block)) => {
                let packets = match block.packets() {
                    Ok(packets) => packets,
                    Err(err) => {
                        eprintln!("worker #{}: {}", idx, err);
                        continue;
                    }
                };
                for pack in packets {
                    let _payload = pack.payload();

                    //do something
                }
                if let Err(err) = client.return_block(block) {
                    eprintln!("worker #{}: {}", idx, err);
                }
            }
            Ok(None) => unreachable!("get_block(-1) blocks forever"),
            Err(err) => {
                eprintln!("worker #{} failure: {}", idx, err);
                return;
            }
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let socket_path = args
        .get(1)
        .expect("usage: testimony_simple_example <socket path> <fanout size>");
    let fanout_size: u32 = args
        .get(2)
        .expect("usage: testimony_simple_example <socket path> <fanout size>")
        .parse()
        .expect("fanout size must be a non-negative integer");

    let mut handles = Vec::new();
    for idx in 0..fanout_size {
        let socket_path = socket_path.clone();
        handles.push(thread::spawn(move || worker(idx, socket_path)));
    }
    for handle in handles {
        let _ = handle.join();
    }
}
