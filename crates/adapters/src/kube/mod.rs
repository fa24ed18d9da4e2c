pub mod client;

pub use client::KubeControlPlane;
