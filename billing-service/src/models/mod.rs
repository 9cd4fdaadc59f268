//! Domain models for billing-service.

mod action;
mod invoice;
mod service;
mod task;

pub use action::{ActionLock, ActionStatus, ActionTaskArgs};
pub use invoice::{
    CreateInvoice, CreateInvoiceItem, CreatePayment, Invoice, InvoiceItem, InvoiceItemType,
    InvoiceStatus, Payment,
};
pub use service::{CreateService, Service, ServiceStatus};
pub use task::Task;
