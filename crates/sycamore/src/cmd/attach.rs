use crate::cmd::AttachArgs;
use crate::exit::CliResult;
use crate::output::OutputFormat;

#[cfg(unix)]
pub fn run(args: AttachArgs, format: OutputFormat) -> CliResult<i32> {
    unix::run(args, format)
}

#[cfg(not(unix))]
pub fn run(_args: AttachArgs, _format: OutputFormat) -> CliResult<i32> {
    Err(crate::exit::CliError::new(
        crate::exit::USAGE,
        "attach requires Unix domain sockets",
    ))
}

#[cfg(unix)]
mod unix {
    use std::sync::Arc;

    use sycamore_bus::{Bus, BusConfig, BusEvent};
    use sycamore_frame::Frame;
    use sycamore_transport::StreamTransport;
    use tokio::net::UnixStream;
    use tokio::sync::broadcast::error::RecvError;
    use tracing::{debug, info, warn};

    use crate::cmd::{build_runtime, parse_duration, AttachArgs};
    use crate::exit::{bus_error, io_error, transport_error, CliResult, SUCCESS};
    use crate::output::{print_event, print_frames, OutputFormat};

    pub fn run(args: AttachArgs, format: OutputFormat) -> CliResult<i32> {
        let duration = args.duration.as_deref().map(parse_duration).transpose()?;
        let config = BusConfig {
            ping_interval: parse_duration(&args.ping_interval)?,
            max_missed_pings: args.max_missed,
            ..BusConfig::default()
        };

        let runtime = build_runtime()?;
        runtime.block_on(async move {
            let stream = UnixStream::connect(&args.path)
                .await
                .map_err(|err| io_error(&format!("connect {}", args.path.display()), err))?;
            let (transport, pump) = StreamTransport::new(stream);
            let bus = Bus::attach(Arc::new(transport), config)
                .map_err(|err| bus_error("attach failed", err))?;
            let mut events = bus.subscribe();
            let mut pump = tokio::spawn(pump.run(bus.sink()));
            info!(path = %args.path.display(), "attached");

            let deadline = async {
                match duration {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);
            let mut pending_data = args.data.map(String::into_bytes);

            let result = loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        debug!("interrupted");
                        break Ok(SUCCESS);
                    }
                    _ = &mut deadline => break Ok(SUCCESS),
                    ended = &mut pump => {
                        break match ended {
                            Ok(Ok(())) => Ok(SUCCESS),
                            Ok(Err(err)) => Err(transport_error("link failed", err)),
                            Err(err) => {
                                warn!(error = %err, "transport pump ended abnormally");
                                Ok(SUCCESS)
                            }
                        };
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            print_event(&event, format);
                            if let BusEvent::DeviceAdded(entry) = &event {
                                if entry.slot == args.slot {
                                    if let Some(payload) = pending_data.take() {
                                        send_and_print(&bus, args.slot, payload, format);
                                    }
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                        Err(RecvError::Closed) => break Ok(SUCCESS),
                    },
                }
            };

            bus.detach().await;
            pump.abort();
            result
        })
    }

    /// Write `payload` to the device and print the first reply, off the event loop.
    fn send_and_print(bus: &Bus, slot: u8, payload: Vec<u8>, format: OutputFormat) {
        let device = match bus.device(slot) {
            Ok(device) => device,
            Err(err) => {
                warn!(slot, error = %err, "device vanished before write");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = device.write(&payload).await {
                warn!(slot, error = %err, "device write failed");
                return;
            }
            match device.read(usize::from(u16::MAX)).await {
                Ok(reply) => print_frames(&[Frame::data(slot, reply)], format),
                Err(err) => warn!(slot, error = %err, "no reply from device"),
            }
        });
    }
}
