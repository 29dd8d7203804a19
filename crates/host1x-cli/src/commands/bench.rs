use super::{single_channel_device, submit_one};

pub fn run(ring_words: usize, jobs: usize) {
    let device = single_channel_device(ring_words);
    let ctx = device.open_context();

    let start = std::time::Instant::now();
    let mut completed = 0usize;
    for i in 0..jobs {
        match submit_one(&device, &ctx) {
            Ok(_) => completed += 1,
            Err(e) => {
                eprintln!("job {i} failed after {completed} completions: {e}");
                break;
            }
        }
    }
    let elapsed = start.elapsed();

    println!("{completed}/{jobs} jobs completed through a {ring_words}-word ring in {elapsed:?}");
    if completed > 0 {
        println!("{:.1} jobs/sec", completed as f64 / elapsed.as_secs_f64());
    }
}
