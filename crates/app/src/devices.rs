//! Device listing and interactive selection

use micmon_core::domain::audio::{Channel, DeviceInfo};
use std::io::{self, BufRead, Write};

/// Render the input device table printed by `--list-devices` and the prompt
pub fn format_device_table(devices: &[DeviceInfo]) -> String {
    if devices.is_empty() {
        return "No input devices found\n".to_string();
    }

    let mut table = format!("{:>5}  {:<48} {:>8} {:>10}\n", "Index", "Name", "Channels", "Rate");
    for device in devices {
        let rate = device
            .default_rate
            .map(|rate| format!("{} Hz", rate))
            .unwrap_or_else(|| "-".to_string());
        table.push_str(&format!(
            "{:>5}  {:<48} {:>8} {:>10}\n",
            device.index, device.name, device.channels, rate
        ));
    }
    table
}

/// Ask for a device index until a listed one is entered
///
/// Fails with `UnexpectedEof` if input ends first.
pub fn prompt_device_index<R, W>(
    channel: Channel,
    devices: &[DeviceInfo],
    input: &mut R,
    output: &mut W,
) -> io::Result<usize>
where
    R: BufRead,
    W: Write,
{
    loop {
        write!(output, "Select the {} microphone index: ", channel)?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("no device index given for the {} channel", channel),
            ));
        }

        match line.trim().parse::<usize>() {
            Ok(index) if devices.iter().any(|d| d.index == index) => return Ok(index),
            Ok(index) => writeln!(output, "No input device with index {}", index)?,
            Err(_) => writeln!(output, "Please enter a number")?,
        }
    }
}
