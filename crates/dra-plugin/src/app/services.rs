use std::sync::Arc;

use crate::driver::Driver;
use crate::inventory::refresher::InventoryRefresher;
use crate::inventory::DeviceInventory;

/// Long lived components shared by the background tasks
pub struct ApplicationServices<P> {
    pub driver: Arc<Driver<P>>,
    pub inventory: Arc<DeviceInventory>,
    pub refresher: Arc<InventoryRefresher>,
}
