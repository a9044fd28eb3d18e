pub mod cart_line;
pub mod order;
pub mod order_line;
pub mod product;
pub mod product_review;

// Re-export entities
pub use cart_line::{Entity as CartLine, Model as CartLineModel};
pub use order::{
    DeliveryAddress, Entity as Order, Model as OrderModel, OrderStatus, PaymentMethod,
    PaymentStatus, ShippingMethod,
};
pub use order_line::{Entity as OrderLine, Model as OrderLineModel, ProductionStatus};
pub use product::{
    Dimensions, Entity as Product, Model as ProductModel, ProductOrdering, ProductStatus,
};
pub use product_review::{Entity as ProductReview, Model as ProductReviewModel};
