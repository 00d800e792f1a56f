use tracing::{debug, info, warn};

use crate::core::{Error, Result, ShortAddress};
use crate::network::ScheduledLink;
use super::layout::{ScheduleSlot, SlotframeLayout};

/// Applies the slotframe layout to a link
///
/// Every operation stops at the first slot the link refuses and reports
/// a generic failure. Slots applied before the failure stay in place.
#[derive(Debug, Clone)]
pub struct ScheduleManager {
    layout: SlotframeLayout,
}

impl ScheduleManager {
    /// Creates a manager for `layout`
    pub fn new(layout: SlotframeLayout) -> Result<Self> {
        layout.validate()?;
        Ok(ScheduleManager { layout })
    }

    /// Returns the layout in use
    pub fn layout(&self) -> &SlotframeLayout {
        &self.layout
    }

    /// Creates the application slotframe
    pub fn init_slotframe(&self, link: &mut dyn ScheduledLink) -> Result<()> {
        let len = self.layout.slotframe_len();
        info!(len, "Init slotframe");
        link.init_slotframe(len)
            .map_err(|e| Error::schedule(format!("init slotframe: {}", e)))
    }

    /// Adds the beacon slots
    pub fn add_beacon_slots(&self, link: &mut dyn ScheduledLink) -> Result<()> {
        info!("Add beacon slots");
        add_all(link, &self.layout.beacon_slots(), "beacon")
    }

    /// Removes the beacon slots
    pub fn remove_beacon_slots(&self, link: &mut dyn ScheduledLink) -> Result<()> {
        info!("Delete beacon slots");
        remove_all(link, &self.layout.beacon_slots(), "beacon")
    }

    /// Adds the shared join-request slots
    pub fn add_join_request_slots(&self, link: &mut dyn ScheduledLink) -> Result<()> {
        info!("Add join request slots");
        add_all(link, &self.layout.join_request_slots(), "join request")
    }

    /// Removes the shared join-request slots
    pub fn remove_join_request_slots(&self, link: &mut dyn ScheduledLink) -> Result<()> {
        info!("Delete join request slots");
        remove_all(link, &self.layout.join_request_slots(), "join request")
    }

    /// Adds the join-process slots addressed to `peer`
    pub fn add_join_process_slots(
        &self,
        link: &mut dyn ScheduledLink,
        peer: ShortAddress,
    ) -> Result<()> {
        info!(%peer, "Add join process slots");
        add_all(link, &self.layout.join_process_slots(peer), "join process")
    }

    /// Removes the join-process slots
    pub fn remove_join_process_slots(&self, link: &mut dyn ScheduledLink) -> Result<()> {
        info!("Delete join process slots");
        remove_all(
            link,
            &self.layout.join_process_slots(ShortAddress::BROADCAST),
            "join process",
        )
    }

    /// Adds the dedicated data slots of `address`
    pub fn add_data_slots(&self, link: &mut dyn ScheduledLink, address: ShortAddress) -> Result<()> {
        let slots = self.layout.data_slots(address)?;
        info!(%address, "Add data slots");
        add_all(link, &slots, "data")
    }

    /// Removes the dedicated data slots of `address`
    pub fn remove_data_slots(
        &self,
        link: &mut dyn ScheduledLink,
        address: ShortAddress,
    ) -> Result<()> {
        let slots = self.layout.data_slots(address)?;
        info!(%address, "Delete data slots");
        remove_all(link, &slots, "data")
    }

    /// Logs a failed slot operation and carries on
    pub fn tolerate(result: Result<()>) {
        if let Err(e) = result {
            warn!(error = %e, "Schedule update incomplete");
        }
    }
}

fn add_all(link: &mut dyn ScheduledLink, slots: &[ScheduleSlot], class: &str) -> Result<()> {
    for slot in slots {
        debug!(offset = slot.slot_offset, options = ?slot.options, "add link");
        link.add_link(slot).map_err(|e| {
            Error::schedule(format!("add {} slot {}: {}", class, slot.slot_offset, e))
        })?;
    }
    Ok(())
}

fn remove_all(link: &mut dyn ScheduledLink, slots: &[ScheduleSlot], class: &str) -> Result<()> {
    for slot in slots {
        link.remove_link(slot.slot_offset, slot.channel_offset).map_err(|e| {
            Error::schedule(format!("remove {} slot {}: {}", class, slot.slot_offset, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::network::SimLink;

    #[test]
    fn test_invalid_layout_rejected() {
        let layout = SlotframeLayout {
            join_process_slots: 400,
            ..SlotframeLayout::default()
        };
        assert!(ScheduleManager::new(layout).is_err());
    }

    #[test]
    fn test_add_and_remove_classes() {
        let (mut link, handle, _events) = SimLink::new();
        let schedule = ScheduleManager::new(SlotframeLayout::default()).unwrap();

        schedule.init_slotframe(&mut link).unwrap();
        assert_eq!(handle.slotframe_len(), Some(425));

        schedule.add_beacon_slots(&mut link).unwrap();
        schedule.add_join_request_slots(&mut link).unwrap();
        schedule.add_join_process_slots(&mut link, ShortAddress(1)).unwrap();
        assert_eq!(handle.links().len(), 25);

        schedule.remove_join_request_slots(&mut link).unwrap();
        schedule.remove_join_process_slots(&mut link).unwrap();
        assert_eq!(handle.links().len(), 1);

        schedule.add_data_slots(&mut link, ShortAddress(3)).unwrap();
        let offsets: Vec<u16> = handle.links().iter().map(|s| s.slot_offset).collect();
        assert_eq!(offsets, vec![0, 29, 30, 229]);

        schedule.remove_data_slots(&mut link, ShortAddress(3)).unwrap();
        schedule.remove_beacon_slots(&mut link).unwrap();
        assert!(handle.links().is_empty());
    }

    #[test]
    fn test_stops_at_first_failure() {
        let (mut link, handle, _events) = SimLink::new();
        let schedule = ScheduleManager::new(SlotframeLayout::default()).unwrap();

        handle.fail_links_after(5);
        let err = schedule.add_join_request_slots(&mut link).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenericFailure);
        assert_eq!(handle.links().len(), 5);
    }

    #[test]
    fn test_remove_missing_slot_fails() {
        let (mut link, _handle, _events) = SimLink::new();
        let schedule = ScheduleManager::new(SlotframeLayout::default()).unwrap();
        assert!(schedule.remove_join_process_slots(&mut link).is_err());
    }

    #[test]
    fn test_null_address_data_slots() {
        let (mut link, handle, _events) = SimLink::new();
        let schedule = ScheduleManager::new(SlotframeLayout::default()).unwrap();
        assert!(matches!(
            schedule.add_data_slots(&mut link, ShortAddress::NULL),
            Err(Error::InvalidAddress(0))
        ));
        assert!(handle.links().is_empty());
    }
}
