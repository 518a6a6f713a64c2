//! Processor Task - the async transport boundary of the emulated controller
//!
//! Wraps one controller of the global scatternet behind a pair of static
//! packet channels so an async host stack (or a test harness) can talk to it
//! the way it would talk to real hardware: HCI command/ACL/SCO packets go
//! in, event and ACL packets come out. A third channel carries virtual-clock
//! ticks so timer-driven events (inquiry completion, mode expiry) fire from
//! whatever time source the embedder has.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mockingbird::{clock::Duration, processor};
//!
//! # async fn example(device: mockingbird::DeviceId) {
//! // In your Embassy spawner, after init_scatternet():
//! // spawner.spawn(processor::run(device)).unwrap();
//!
//! // Host to controller: a Reset command.
//! let mut reset = heapless::Vec::new();
//! reset.extend_from_slice(&[0x03, 0x0C, 0x00]).unwrap();
//! processor::submit(processor::HostPacket::Command(reset)).await;
//!
//! // Controller to host: the answering event.
//! let packet = processor::receive().await;
//!
//! // Let 100 ms of virtual time pass.
//! processor::advance(Duration::from_millis(100)).await;
//! # let _ = packet;
//! # }
//! ```

use crate::{
    DeviceId,
    clock::Duration,
    constants::{ACL_PACKET_SIZE, ACL_QUEUE_DEPTH, EVENT_QUEUE_DEPTH},
    hci::{AclPacket, EventPacket},
    scatternet,
};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use heapless::Vec;

/// Depth of the packet channels
pub const CHANNEL_DEPTH: usize = 4;

/// Largest host-to-controller command or SCO packet
pub const MAX_HOST_PACKET: usize = 258;

/// A packet travelling from the host stack into the controller
#[derive(Debug, Clone)]
pub enum HostPacket {
    /// HCI command packet
    Command(Vec<u8, MAX_HOST_PACKET>),
    /// HCI ACL data packet
    Acl(Vec<u8, ACL_PACKET_SIZE>),
    /// HCI SCO data packet
    Sco(Vec<u8, MAX_HOST_PACKET>),
}

/// A packet travelling from the controller to the host stack
#[derive(Debug, Clone)]
pub enum ControllerPacket {
    /// HCI event packet
    Event(EventPacket),
    /// HCI ACL data packet
    Acl(AclPacket),
}

pub(crate) static HOST_CHANNEL: Channel<CriticalSectionRawMutex, HostPacket, CHANNEL_DEPTH> =
    Channel::new();

pub(crate) static CONTROLLER_CHANNEL: Channel<
    CriticalSectionRawMutex,
    ControllerPacket,
    CHANNEL_DEPTH,
> = Channel::new();

pub(crate) static CLOCK_CHANNEL: Channel<CriticalSectionRawMutex, Duration, CHANNEL_DEPTH> =
    Channel::new();

/// Hand one host packet to the controller
pub async fn submit(packet: HostPacket) {
    HOST_CHANNEL.sender().send(packet).await;
}

/// Take the next controller-to-host packet
pub async fn receive() -> ControllerPacket {
    CONTROLLER_CHANNEL.receiver().receive().await
}

/// Advance the virtual clock of the scatternet
pub async fn advance(duration: Duration) {
    CLOCK_CHANNEL.sender().send(duration).await;
}

async fn host_packet_pump(device: DeviceId) -> ! {
    loop {
        let packet = HOST_CHANNEL.receiver().receive().await;
        defmt::debug!(
            "[PROCESSOR] host packet: {:?}",
            defmt::Debug2Format(&packet)
        );

        let outbound = match scatternet().await {
            Ok(mut net) => {
                let result = match &packet {
                    HostPacket::Command(bytes) => net.hci_command(device, bytes),
                    HostPacket::Acl(bytes) => net.hci_acl(device, bytes),
                    HostPacket::Sco(bytes) => net.hci_sco(device, bytes),
                };
                if let Err(e) = result {
                    defmt::error!(
                        "[PROCESSOR] packet rejected: {:?}",
                        defmt::Debug2Format(&e)
                    );
                }
                drain(&mut net, device)
            }
            Err(e) => {
                defmt::error!("[PROCESSOR] scatternet not initialized: {}", e);
                Vec::new()
            }
        };

        for packet in outbound {
            CONTROLLER_CHANNEL.sender().send(packet).await;
        }
    }
}

async fn clock_pump(device: DeviceId) -> ! {
    loop {
        let duration = CLOCK_CHANNEL.receiver().receive().await;

        let outbound = match scatternet().await {
            Ok(mut net) => {
                net.advance(duration);
                drain(&mut net, device)
            }
            Err(e) => {
                defmt::error!("[PROCESSOR] scatternet not initialized: {}", e);
                Vec::new()
            }
        };

        for packet in outbound {
            CONTROLLER_CHANNEL.sender().send(packet).await;
        }
    }
}

/// Collect pending controller output while the lock is held
///
/// The channel sends happen after the scatternet lock is released, so a slow
/// consumer can never wedge the engine.
fn drain(
    net: &mut crate::Scatternet,
    device: DeviceId,
) -> Vec<ControllerPacket, { EVENT_QUEUE_DEPTH + ACL_QUEUE_DEPTH }> {
    let mut outbound = Vec::new();
    while let Some(event) = net.poll_event(device) {
        if outbound.push(ControllerPacket::Event(event)).is_err() {
            defmt::error!("[PROCESSOR] outbound burst overflow, dropping event");
        }
    }
    while let Some(acl) = net.poll_acl(device) {
        if outbound.push(ControllerPacket::Acl(acl)).is_err() {
            defmt::error!("[PROCESSOR] outbound burst overflow, dropping ACL packet");
        }
    }
    outbound
}

/// Run the transport pumps for one controller
///
/// Feed packets through [`submit`] and virtual time through [`advance`];
/// everything the controller emits arrives at [`receive`].
pub async fn run(device: DeviceId) {
    embassy_futures::select::select(host_packet_pump(device), clock_pump(device)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::{block_on, select::Either, select::select};

    #[test]
    fn test_reset_roundtrip_through_channels() {
        block_on(async {
            crate::init_scatternet().await.unwrap();
            let device = {
                let mut net = crate::scatternet().await.unwrap();
                net.add_controller().unwrap()
            };

            let mut reset = Vec::new();
            reset.extend_from_slice(&[0x03, 0x0C, 0x00]).unwrap();

            let exchange = async {
                submit(HostPacket::Command(reset)).await;
                receive().await
            };

            match select(run(device), exchange).await {
                Either::Second(ControllerPacket::Event(event)) => {
                    // Command Status for Reset.
                    assert_eq!(event[0], 0x0F);
                    assert_eq!(event[2], 0x00);
                }
                _ => panic!("expected an event packet"),
            }
        });
    }
}
