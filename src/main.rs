use std::sync::Arc;

use esp_ble_midi::{
    radio::{sim::SimAir, BdAddr},
    MidiClient, MidiLink, MidiServer,
};

const PIANO: BdAddr = BdAddr::from_bytes([0x24, 0x0a, 0xc4, 0x12, 0x34, 0x56]);
const HOST: BdAddr = BdAddr::from_bytes([0x24, 0x0a, 0xc4, 0x65, 0x43, 0x21]);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("BLE MIDI demo failed: {:?}", err);
        std::process::exit(1);
    }
}

/// A piano (peripheral) and a host (central) on the simulated radio: scan,
/// connect, play a note each way, disconnect.
fn run() -> anyhow::Result<()> {
    let air = SimAir::new();

    let server = MidiServer::new(Arc::new(air.peripheral(PIANO)?));
    server.set_on_connect(|| log::info!("[Piano] host connected"))?;
    server.set_on_disconnect(|| log::info!("[Piano] host disconnected"))?;
    server.set_packet_handler(|bytes| log::info!("[Piano] received {:02x?}", bytes))?;
    server.begin("Piano")?;

    let client = MidiClient::new(Arc::new(air.central(HOST)?));
    client.set_on_connect(|| log::info!("[Host] connected"))?;
    client.set_on_disconnect(|| log::info!("[Host] disconnected"))?;
    client.set_packet_handler(|bytes| log::info!("[Host] received {:02x?}", bytes))?;
    client.begin("Host")?;

    if client.scan_for(1000)? == 0 {
        log::warn!("No BLE MIDI device found");
        return Ok(());
    }

    let Some(candidate) = client.candidate(0) else {
        log::error!("Candidate list changed under us");
        return Ok(());
    };
    client.connect(0)?;
    server.process_events();
    client.process_events();
    log::info!("Linked to \"{}\" ({})", candidate.name, candidate.address);

    // Note on from the host, note off from the piano; middle C
    client.send(&[0x90, 0x3c, 0x64])?;
    server.send(&[0x80, 0x3c, 0x00])?;
    server.process_events();
    client.process_events();

    client.disconnect()?;
    server.process_events();
    client.process_events();
    log::info!(
        "Piano advertising again: {}, host state: {:?}",
        server.is_advertising(),
        client.state()
    );

    client.end()?;
    server.end()?;

    Ok(())
}
