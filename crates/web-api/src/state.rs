use std::sync::Arc;

use application::RealtimeCore;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub core: RealtimeCore,
    pub jwt_service: Arc<JwtService>,
    /// 每个连接的出站队列容量
    pub outbound_capacity: usize,
}

impl AppState {
    pub fn new(core: RealtimeCore, jwt_service: Arc<JwtService>, outbound_capacity: usize) -> Self {
        Self {
            core,
            jwt_service,
            outbound_capacity,
        }
    }
}
