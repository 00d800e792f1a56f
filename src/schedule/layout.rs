use std::ops::Range;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, ShortAddress};

bitflags! {
    /// Link options of a scheduled slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LinkOptions: u8 {
        /// The node may transmit in this slot
        const TX = 0b0000_0001;
        /// The node listens in this slot
        const RX = 0b0000_0010;
        /// Contention slot shared with other nodes
        const SHARED = 0b0000_0100;
    }
}

/// Class of traffic a slot carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameClass {
    /// Beacons only
    AdvertisingOnly,
    /// Regular data and join traffic
    Normal,
    /// Retransmissions of a frame first sent in the preceding slot
    NormalRetransmit,
}

/// One entry of the shared cyclic schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleSlot {
    /// Offset within the slotframe
    pub slot_offset: u16,
    /// Channel offset within the hopping sequence
    pub channel_offset: u16,
    /// TX/RX/shared options
    pub options: LinkOptions,
    /// Traffic class
    pub frame_class: FrameClass,
    /// Peer address, broadcast for shared slots
    pub peer: ShortAddress,
}

/// Slot class within a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotClass {
    Beacon,
    JoinRequest,
    JoinProcess,
    Data,
}

/// Shape of the shared slotframe
///
/// The frame is made of `section_count` sections of `section_size` slots,
/// each laid out as beacon, join-request, join-process, device TX and
/// device RX runs. Device TX and RX runs hold two slots per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotframeLayout {
    /// Slots per section
    pub section_size: u16,
    /// Number of sections in the slotframe
    pub section_count: u16,
    /// A beacon slot is placed in every `beacon_divisor`-th section
    pub beacon_divisor: u16,
    /// Beacon slots per section
    pub beacon_slots: u16,
    /// Join-request slots per section
    pub join_request_slots: u16,
    /// Join-process slots per section
    pub join_process_slots: u16,
    /// Devices with a TX pair per section
    pub tx_slots_per_section: u16,
    /// Devices with an RX pair per section
    pub rx_slots_per_section: u16,
}

impl Default for SlotframeLayout {
    fn default() -> Self {
        SlotframeLayout {
            section_size: 425,
            section_count: 1,
            beacon_divisor: 1,
            beacon_slots: 1,
            join_request_slots: 12,
            join_process_slots: 12,
            tx_slots_per_section: 100,
            rx_slots_per_section: 100,
        }
    }
}

impl SlotframeLayout {
    /// Total slotframe length
    pub fn slotframe_len(&self) -> u16 {
        self.section_size.saturating_mul(self.section_count)
    }

    fn join_request_start(&self) -> u16 {
        self.beacon_slots
    }

    fn join_process_start(&self) -> u16 {
        self.beacon_slots + self.join_request_slots
    }

    fn data_start(&self) -> u16 {
        self.beacon_slots + self.join_request_slots + self.join_process_slots
    }

    fn data_end(&self) -> u32 {
        u32::from(self.data_start())
            + 2 * u32::from(self.tx_slots_per_section)
            + 2 * u32::from(self.rx_slots_per_section)
    }

    /// Section-relative range of a slot class
    pub fn class_range(&self, class: SlotClass) -> Range<u16> {
        match class {
            SlotClass::Beacon => 0..self.beacon_slots,
            SlotClass::JoinRequest => self.join_request_start()..self.join_process_start(),
            SlotClass::JoinProcess => self.join_process_start()..self.data_start(),
            SlotClass::Data => {
                self.data_start()..self.data_end().min(u32::from(u16::MAX)) as u16
            }
        }
    }

    /// Section-relative ranges of all four slot classes
    pub fn class_ranges(&self) -> [(SlotClass, Range<u16>); 4] {
        [
            (SlotClass::Beacon, self.class_range(SlotClass::Beacon)),
            (SlotClass::JoinRequest, self.class_range(SlotClass::JoinRequest)),
            (SlotClass::JoinProcess, self.class_range(SlotClass::JoinProcess)),
            (SlotClass::Data, self.class_range(SlotClass::Data)),
        ]
    }

    /// Checks that every class fits into a single section
    pub fn validate(&self) -> Result<()> {
        if self.section_size == 0 || self.section_count == 0 || self.beacon_divisor == 0 {
            return Err(Error::invalid_parameter(
                "section size, section count and beacon divisor must be non-zero",
            ));
        }
        if self.tx_slots_per_section == 0 || self.rx_slots_per_section == 0 {
            return Err(Error::invalid_parameter("data runs must not be empty"));
        }
        if self.data_end() > u32::from(self.section_size) {
            return Err(Error::invalid_parameter(format!(
                "slot classes need {} slots, section holds {}",
                self.data_end(),
                self.section_size
            )));
        }
        if u32::from(self.section_size) * u32::from(self.section_count) > u32::from(u16::MAX) {
            return Err(Error::invalid_parameter("slotframe exceeds 65535 slots"));
        }
        Ok(())
    }

    /// Beacon slots, one per `beacon_divisor`-th section
    pub fn beacon_slots(&self) -> Vec<ScheduleSlot> {
        (0..self.section_count)
            .step_by(usize::from(self.beacon_divisor.max(1)))
            .map(|section| ScheduleSlot {
                slot_offset: section * self.section_size,
                channel_offset: 0,
                options: LinkOptions::RX | LinkOptions::SHARED,
                frame_class: FrameClass::AdvertisingOnly,
                peer: ShortAddress::BROADCAST,
            })
            .collect()
    }

    /// Join-request slots in every section
    pub fn join_request_slots(&self) -> Vec<ScheduleSlot> {
        self.section_runs(SlotClass::JoinRequest, |slot_offset| ScheduleSlot {
            slot_offset,
            channel_offset: 0,
            options: LinkOptions::TX | LinkOptions::SHARED,
            frame_class: FrameClass::Normal,
            peer: ShortAddress::BROADCAST,
        })
    }

    /// Join-process slots in every section, addressed to `peer`
    pub fn join_process_slots(&self, peer: ShortAddress) -> Vec<ScheduleSlot> {
        self.section_runs(SlotClass::JoinProcess, |slot_offset| ScheduleSlot {
            slot_offset,
            channel_offset: 0,
            options: LinkOptions::RX | LinkOptions::TX,
            frame_class: FrameClass::Normal,
            peer,
        })
    }

    /// Dedicated slots of a device: TX, TX retransmit and RX
    ///
    /// Device `a` uses index `a - 1`. Index `i` owns the TX pair at
    /// `(i mod T) * 2` in section `i / T` and the RX slot at
    /// `2T + (i mod R) * 2` in section `i / R`.
    ///
    /// Coordinators that place the pair at `(i * 2) mod T` instead agree
    /// with this only for `i < T / 2`. Past that point both schedules put
    /// devices on different slots, so the two formulas do not interoperate.
    pub fn data_slots(&self, address: ShortAddress) -> Result<Vec<ScheduleSlot>> {
        let index = address
            .get()
            .checked_sub(1)
            .map(u32::from)
            .ok_or(Error::InvalidAddress(address.get()))?;

        let tx_per_section = u32::from(self.tx_slots_per_section.max(1));
        let rx_per_section = u32::from(self.rx_slots_per_section.max(1));
        let section_size = u32::from(self.section_size);
        let data_start = u32::from(self.data_start());

        let tx_offset = (index / tx_per_section) * section_size
            + data_start
            + (index % tx_per_section) * 2;
        let rx_offset = (index / rx_per_section) * section_size
            + data_start
            + 2 * tx_per_section
            + (index % rx_per_section) * 2;

        let to_offset = |offset: u32| {
            u16::try_from(offset).map_err(|_| Error::InvalidAddress(address.get()))
        };
        let tx_offset = to_offset(tx_offset)?;
        let retransmit_offset = to_offset(u32::from(tx_offset) + 1)?;
        let rx_offset = to_offset(rx_offset)?;

        Ok(vec![
            ScheduleSlot {
                slot_offset: tx_offset,
                channel_offset: 0,
                options: LinkOptions::TX,
                frame_class: FrameClass::Normal,
                peer: ShortAddress::BROADCAST,
            },
            ScheduleSlot {
                slot_offset: retransmit_offset,
                channel_offset: 0,
                options: LinkOptions::TX,
                frame_class: FrameClass::NormalRetransmit,
                peer: ShortAddress::BROADCAST,
            },
            ScheduleSlot {
                slot_offset: rx_offset,
                channel_offset: 0,
                options: LinkOptions::RX,
                frame_class: FrameClass::Normal,
                peer: ShortAddress::BROADCAST,
            },
        ])
    }

    fn section_runs(
        &self,
        class: SlotClass,
        make: impl Fn(u16) -> ScheduleSlot,
    ) -> Vec<ScheduleSlot> {
        let range = self.class_range(class);
        (0..self.section_count)
            .flat_map(|section| {
                let base = section * self.section_size;
                range.clone().map(move |offset| base + offset)
            })
            .map(make)
            .collect()
    }
}
