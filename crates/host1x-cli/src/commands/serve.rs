use super::single_channel_device;

pub fn run(host: &str, port: u16) {
    let device = single_channel_device(4096);
    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    rt.block_on(host1x_server::run_server(device, host, port));
}
