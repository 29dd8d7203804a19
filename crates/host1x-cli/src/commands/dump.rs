use super::{single_channel_device, submit_one};

pub fn run(jobs: usize, json: bool) {
    let device = single_channel_device(4096);
    let ctx = device.open_context();
    for _ in 0..jobs {
        if let Err(e) = submit_one(&device, &ctx) {
            eprintln!("submit failed during warmup: {e}");
            std::process::exit(1);
        }
    }

    let dump = device.dump();
    if json {
        match serde_json::to_string_pretty(&dump) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("failed to render JSON: {e}"),
        }
    } else {
        print!("{}", dump.to_text());
    }
}
