use super::{single_channel_device, submit_one};

pub fn run(ring_words: usize) {
    let device = single_channel_device(ring_words);
    let ctx = device.open_context();
    match submit_one(&device, &ctx) {
        Ok(job_id) => println!("job {job_id} completed"),
        Err(e) => {
            eprintln!("submit failed: {e}");
            std::process::exit(1);
        }
    }
}
