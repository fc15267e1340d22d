//! Macro operations of the MD-100
//!
//! Every operation runs through the device's [`MacroExecutor`], so at most
//! one of them is active at a time while polling continues underneath.
//!
//! [`MacroExecutor`]: crate::core::device::MacroExecutor

use super::{DispenseResult, DispenseSlot, Md100, OperationMode, Paymode, PayoutStrategy};
use crate::core::device::bill_types::{self, ALL_BILL_TYPES_MASK, BILL_TYPE_COUNT};
use crate::core::device::events::DeviceState;
use crate::core::device::macros::OperationHandle;
use crate::core::device::state_machine::Property;
use crate::core::device::DeviceError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

impl Md100 {
    /// Read identity and configuration and put the device into game mode
    pub fn init(self: &Arc<Self>, timeout: Option<Duration>) -> Result<OperationHandle<()>, DeviceError> {
        let device = Arc::clone(self);
        self.executor.start("init", timeout, move |token| async move {
            device.init_sequence(&token).await
        })
    }

    /// Soft reset followed by the init sequence
    pub fn reset(self: &Arc<Self>, timeout: Option<Duration>) -> Result<OperationHandle<()>, DeviceError> {
        let device = Arc::clone(self);
        self.executor.start("reset", timeout, move |token| async move {
            device.slave.reset_device().await?;
            device.init_sequence(&token).await
        })
    }

    /// Enable the bill types in `mask` and verify the device took it
    ///
    /// The operation's value is the mask read back from the device.
    pub fn enable_bill_types(
        self: &Arc<Self>,
        mask: u32,
        timeout: Option<Duration>,
    ) -> Result<OperationHandle<u32>, DeviceError> {
        if mask > ALL_BILL_TYPES_MASK {
            return Err(DeviceError::InvalidArgument(format!(
                "mask {mask:#x} has bits above bill type {BILL_TYPE_COUNT}"
            )));
        }
        let device = Arc::clone(self);
        self.executor.start("enable bill types", timeout, move |token| async move {
            device.enable_sequence(mask, &token).await
        })
    }

    /// Pay out one bill from a dispenser slot
    pub fn dispense(
        self: &Arc<Self>,
        slot: DispenseSlot,
        timeout: Option<Duration>,
    ) -> Result<OperationHandle<DispenseResult>, DeviceError> {
        if slot == DispenseSlot::Test {
            return Err(DeviceError::InvalidArgument("cannot dispense from the test slot".into()));
        }
        let device = Arc::clone(self);
        self.executor.start("dispense", timeout, move |token| async move {
            device.dispense_sequence(slot, &token).await
        })
    }

    /// Empty a dispenser slot, reprogram its bill type and re-initialise
    pub fn modify_bill_type(
        self: &Arc<Self>,
        slot: DispenseSlot,
        country: &str,
        value_code: &str,
        max_fill: u16,
        timeout: Option<Duration>,
    ) -> Result<OperationHandle<()>, DeviceError> {
        if slot == DispenseSlot::Test {
            return Err(DeviceError::InvalidArgument("the test slot has no bill type".into()));
        }
        bill_types::bill_id_string(country, value_code, max_fill)?;
        let device = Arc::clone(self);
        let country = country.to_string();
        let value_code = value_code.to_string();
        self.executor.start("modify bill type", timeout, move |token| async move {
            device
                .modify_bill_type_sequence(slot, &country, &value_code, max_fill, &token)
                .await
        })
    }

    async fn init_sequence(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        let country = self.options.country.as_str();

        self.state.wait_for_ready(token).await?;
        let category = self.slave.request_equipment_category_id().await?;
        self.update_info(Property::EquipmentCategory, |info| info.equipment_category = category);
        let product = self.slave.request_product_code().await?;
        self.update_info(Property::ProductCode, |info| info.product_code = product);
        let build = self.slave.request_build_code().await?;
        self.update_info(Property::BuildCode, |info| info.build_code = build);
        let manufacturer = self.slave.request_manufacturer_id().await?;
        self.update_info(Property::ManufacturerId, |info| info.manufacturer_id = manufacturer);
        let serial = self.read_serial_number().await?;
        self.update_info(Property::SerialNumber, |info| info.serial_number = serial);
        let software = self.read_software_revision().await?;
        self.update_info(Property::SoftwareRevision, |info| info.software_revision = software);
        let comms = self.slave.request_comms_revision().await?;
        self.update_info(Property::CommsRevision, |info| info.comms_revision = comms);
        let flags = self.read_option_flags().await?;
        self.update_info(Property::OptionFlags, |info| info.option_flags = flags);
        let checksums = self.read_checksums().await?;
        self.update_info(Property::Checksums, |info| info.checksums = checksums);

        self.state.wait_for_ready(token).await?;
        self.set_date_time(chrono::Local::now().naive_local()).await?;

        self.state.wait_for_ready(token).await?;
        let scaling = self.slave.request_country_scaling_factor(country).await?;
        self.update_info(Property::ScalingFactor, |info| info.scaling_factor = scaling);
        let currency = self.slave.request_currency_revision(Some(country)).await?;
        self.update_info(Property::CurrencyRevision, |info| info.currency_revision = currency);
        for id in 1..=BILL_TYPE_COUNT as u8 {
            self.request_bill_type(id).await?;
        }

        self.state.wait_for_ready(token).await?;
        self.change_operation_mode(OperationMode::Game).await?;

        self.state.wait_for_ready(token).await?;
        let mask = self.read_inhibit_mask().await?;
        self.apply_inhibit_mask(mask).await?;

        self.state.wait_for_ready(token).await?;
        self.read_inhibit_mask().await?;
        self.request_fill_sizes().await?;

        self.state.wait_for_ready(token).await?;
        self.slave.modify_master_inhibit_status(false).await?;

        self.state.wait_for_ready(token).await?;
        self.master_dispense(0, DispenseSlot::Test, Paymode::Real, PayoutStrategy::BiggestBillFirst, 0)
            .await?;
        tracing::info!("device {} initialised", self.slave.address());
        Ok(())
    }

    async fn enable_sequence(&self, mask: u32, token: &CancellationToken) -> Result<u32, DeviceError> {
        self.state.wait_for_quiescence(token).await?;
        self.apply_inhibit_mask(mask).await?;
        self.slave.modify_master_inhibit_status(mask != 0).await?;

        self.state.wait_for_event(DeviceState::Idle, token).await?;
        let settled = if mask != 0 {
            DeviceState::Free
        } else {
            DeviceState::Locked
        };
        self.state.wait_for_event(settled, token).await?;

        let actual = self.read_inhibit_mask().await?;
        self.request_fill_sizes().await?;
        if actual != mask {
            return Err(DeviceError::VerificationMismatch {
                requested: mask,
                actual,
            });
        }
        Ok(actual)
    }

    async fn dispense_sequence(
        &self,
        slot: DispenseSlot,
        token: &CancellationToken,
    ) -> Result<DispenseResult, DeviceError> {
        self.state.wait_for_ready(token).await?;
        let bill_type = slot.code();
        let before = self.bill_types.read().fill_size(bill_type);

        let result = self
            .master_dispense(1, slot, Paymode::Real, PayoutStrategy::BiggestBillFirst, 0)
            .await?;
        if !result.is_ok() {
            tracing::warn!("dispense refused: {}", result.description());
            return Ok(result);
        }

        // a cancelled wait is judged below by the fill size
        let _ = self.state.wait_for_event(DeviceState::MoveBill, token).await;
        let _ = self.state.wait_for_event(DeviceState::Idle, token).await;
        self.state.wait_for_ready(token).await?;
        self.request_fill_sizes().await?;

        if token.is_cancelled() {
            let after = self.bill_types.read().fill_size(bill_type);
            if before.checked_sub(1) == Some(after) {
                return Err(DeviceError::BillNotDispensed);
            }
            return Err(DeviceError::Cancelled);
        }
        Ok(result)
    }

    async fn modify_bill_type_sequence(
        &self,
        slot: DispenseSlot,
        country: &str,
        value_code: &str,
        max_fill: u16,
        token: &CancellationToken,
    ) -> Result<(), DeviceError> {
        self.change_operation_mode(OperationMode::Unload).await?;
        loop {
            // a ready device never blocks the waits below, so check here
            if token.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            self.request_fill_sizes().await?;
            if self.bill_types.read().fill_size(slot.code()) == 0 {
                break;
            }
            self.state.wait_for_ready(token).await?;
            let result = self
                .master_dispense(1, slot, Paymode::Real, PayoutStrategy::BiggestBillFirst, 0)
                .await?;
            if !result.is_ok() {
                return Err(DeviceError::DispenseRefused {
                    code: result.payout_code,
                    reason: result.description(),
                });
            }
            self.state.wait_for_ready(token).await?;
        }

        self.write_bill_type(slot, country, value_code, max_fill).await?;
        self.change_operation_mode(OperationMode::Game).await?;
        self.init_sequence(token).await
    }
}
