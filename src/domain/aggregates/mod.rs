//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;

pub use product::{Product, ProductColor, VariantKind};
pub use order::{Order, OrderId, OrderLine, OrderStatus, PaymentStatus, ShippingAddress};
pub use cart::{Cart, CartError, CartItem, VariantKey};
