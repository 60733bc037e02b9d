pub mod http_delivery;

pub use http_delivery::HttpMutationDelivery;
