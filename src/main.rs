//! Cam-module-core demo: runs a sensor lifecycle against the mock hardware.

use std::sync::Arc;

use cam_module_core::mock::{BusOp, MockBus, MockDelay, MockPlatform, MockSensor, MockSubDevice};
use cam_module_core::{
    Catalog, Configuration, Control, ControlId, FourCC, FrameFormat, FrameInterval, Ioctl,
    IoctlReply, ModeTimings, RegEntry, SensorModule, TimingConfig, Transport,
};

const SENSOR_ADDRESS: u8 = 0x1b;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn catalog() -> cam_module_core::traits::Result<Catalog> {
    let format = FrameFormat::new(1280, 720, FourCC::UYVY);
    let timings = ModeTimings {
        line_length_pck: 2200,
        frame_length_lines: 1125,
        vt_pix_clk_freq_hz: 74_250_000,
        ..ModeTimings::default()
    };
    let script = vec![
        RegEntry::single(0x0103, 0x01),
        RegEntry::delay(5),
        RegEntry::data(0x0340, 0x04),
        RegEntry::data(0x0341, 0x65),
        RegEntry::data(0x0342, 0x08),
        RegEntry::data(0x0343, 0x98),
    ];
    Catalog::new(vec![
        Configuration::new("720p_30", format, FrameInterval::from_fps(30), script.clone())
            .with_timings(timings)
            .with_auto(true, true, true),
        Configuration::new("720p_15", format, FrameInterval::from_fps(15), script)
            .with_diff_script(vec![RegEntry::data(0x0340, 0x08), RegEntry::data(0x0341, 0xca)])
            .with_timings(ModeTimings {
                frame_length_lines: 2250,
                ..timings
            }),
    ])
}

fn run() -> cam_module_core::traits::Result<()> {
    let transport = Transport::new(
        MockBus::new(),
        MockDelay::new(),
        SENSOR_ADDRESS,
        TimingConfig::default(),
    );
    let platform = MockPlatform::new().with_focus(MockSubDevice::new());
    let sensor = MockSensor::new().with_vts_support();
    let mut module = SensorModule::new(transport, platform, sensor, Arc::new(catalog()?));

    module.attach()?;
    let format = FrameFormat::new(1280, 720, FourCC::UYVY);
    module.set_format(&format)?;
    module.set_controls(&[
        Control::new(ControlId::Gain, 32),
        Control::new(ControlId::Exposure, 400),
    ])?;
    println!("Pending controls: {:?}", module.controls().pending);

    module.power_on()?;
    module.stream_on()?;
    println!(
        "Streaming {} at {}",
        module.get_format()?,
        module.get_frame_interval()?
    );

    module.set_frame_interval(FrameInterval::from_fps(20))?;
    println!("Frame length stretched to {:?} lines", module.vts());

    if let IoctlReply::SensorModeData(data) = module.ioctl(Ioctl::SensorModeData)? {
        println!(
            "Mode data: line length {}, frame length {}, exposure {}, gain {}",
            data.timings.line_length_pck, data.timings.frame_length_lines, data.exp_time, data.gain
        );
    }

    module.power_off()?;
    println!("Final state: {:?}", module.state());

    for op in module.transport().bus().ops() {
        match op {
            BusOp::Write { address, bytes } => println!("W {address:#04x} {bytes:02x?}"),
            BusOp::Batch { address, frames } => {
                println!("B {address:#04x} {} frames", frames.len());
            }
            BusOp::Read { address, len } => println!("R {address:#04x} {len} bytes"),
        }
    }
    println!(
        "Slept {} ms in total",
        module.transport().delay().total_ms()
    );
    Ok(())
}
