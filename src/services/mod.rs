pub mod reference_service;
pub mod proof_service;
pub mod request_service;
pub mod notification_service;
