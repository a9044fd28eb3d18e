mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use common::TestApp;
use costura_store::{
    auth::AuthProvider,
    entities::{product_review, CartLine, Dimensions, ProductOrdering, ProductStatus},
    errors::ServiceError,
    services::{CartManager, NewProduct, ProductPatch},
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use uuid::Uuid;

fn listing(name: &str, price: Decimal) -> NewProduct {
    NewProduct {
        name: name.to_string(),
        short_description: Some("Peça única".to_string()),
        description: format!("{} costurada a partir de calças usadas", name),
        price,
        promotional_price: None,
        category_id: None,
        image_url: Some("https://cdn.example.com/pecas/1.jpg".to_string()),
        stock: 3,
        weight: Some(dec!(0.450)),
        dimensions: None,
        material: Some("jeans".to_string()),
        status: ProductStatus::Active,
    }
}

#[tokio::test]
async fn seamstress_lists_a_product() {
    let app = TestApp::new().await;
    let seamstress = app.sign_up_seamstress().await;

    let created = app
        .storefront
        .catalog()
        .create_product(listing("  Bolsa tiracolo ", dec!(55.00)))
        .await
        .unwrap();
    assert_eq!(created.name, "Bolsa tiracolo");
    assert_eq!(created.seamstress_id, seamstress.id);
    assert_eq!(created.dimensions(), None);

    let active = app
        .storefront
        .products()
        .list_active(ProductOrdering::Newest)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, created.id);

    let own = app.storefront.catalog().list_own().await.unwrap();
    assert_eq!(own.len(), 1);
}

#[tokio::test]
async fn listing_keeps_its_dimensions() {
    let app = TestApp::new().await;
    app.sign_up_seamstress().await;
    let size = Dimensions {
        width: dec!(30.0),
        height: dec!(25.0),
        depth: dec!(8.0),
    };
    let mut input = listing("Mochila", dec!(89.90));
    input.dimensions = Some(size);

    let created = app.storefront.catalog().create_product(input).await.unwrap();
    assert_eq!(created.dimensions(), Some(size));
}

#[tokio::test]
async fn customers_cannot_write_the_catalog() {
    let app = TestApp::new().await;
    app.sign_up_customer().await;

    assert_matches!(
        app.storefront
            .catalog()
            .create_product(listing("Bolsa", dec!(30.00)))
            .await,
        Err(ServiceError::Unauthenticated)
    );
    assert_matches!(
        app.storefront.catalog().list_own().await,
        Err(ServiceError::Unauthenticated)
    );
}

#[tokio::test]
async fn malformed_listings_are_rejected() {
    let app = TestApp::new().await;
    app.sign_up_seamstress().await;
    let catalog = app.storefront.catalog();

    assert_matches!(
        catalog.create_product(listing("   ", dec!(30.00))).await,
        Err(ServiceError::ValidationFailed(_))
    );
    assert_matches!(
        catalog.create_product(listing("Bolsa", dec!(0))).await,
        Err(ServiceError::ValidationFailed(_))
    );

    let mut expensive_promo = listing("Bolsa", dec!(30.00));
    expensive_promo.promotional_price = Some(dec!(35.00));
    assert_matches!(
        catalog.create_product(expensive_promo).await,
        Err(ServiceError::ValidationFailed(_))
    );

    let mut bad_image = listing("Bolsa", dec!(30.00));
    bad_image.image_url = Some("not a url".to_string());
    assert_matches!(
        catalog.create_product(bad_image).await,
        Err(ServiceError::ValidationFailed(_))
    );

    assert!(catalog.list_own().await.unwrap().is_empty());
}

#[tokio::test]
async fn prices_beyond_cents_or_the_column_range_are_rejected() {
    let app = TestApp::new().await;
    app.sign_up_seamstress().await;
    let catalog = app.storefront.catalog();

    for price in [dec!(100000000000000000000), dec!(10000000000.00), dec!(10.005)] {
        assert_matches!(
            catalog.create_product(listing("Bolsa", price)).await,
            Err(ServiceError::ValidationFailed(_))
        );
    }
    let mut sub_cent_promo = listing("Bolsa", dec!(30.00));
    sub_cent_promo.promotional_price = Some(dec!(20.005));
    assert_matches!(
        catalog.create_product(sub_cent_promo).await,
        Err(ServiceError::ValidationFailed(_))
    );

    let created = catalog
        .create_product(listing("Bolsa", dec!(45.00)))
        .await
        .unwrap();
    assert_matches!(
        catalog
            .update_product(
                created.id,
                ProductPatch {
                    price: Some(dec!(20.005)),
                    ..Default::default()
                },
            )
            .await,
        Err(ServiceError::ValidationFailed(_))
    );
    assert_eq!(catalog.list_own().await.unwrap().len(), 1);
}

#[tokio::test]
async fn updates_are_visible_through_the_cached_views() {
    let app = TestApp::new().await;
    app.sign_up_seamstress().await;
    let catalog = app.storefront.catalog();
    let created = catalog
        .create_product(listing("Avental", dec!(40.00)))
        .await
        .unwrap();

    let before = app.storefront.products().get_product(created.id).await.unwrap();
    assert_eq!(before.product.price, dec!(40.00));

    catalog
        .update_product(
            created.id,
            ProductPatch {
                price: Some(dec!(45.00)),
                promotional_price: Some(Some(dec!(39.90))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let after = app.storefront.products().get_product(created.id).await.unwrap();
    assert_eq!(after.product.price, dec!(45.00));
    assert_eq!(after.product.effective_price(), dec!(39.90));

    let cleared = catalog
        .update_product(
            created.id,
            ProductPatch {
                promotional_price: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.promotional_price, None);
    assert_eq!(cleared.name, "Avental");
}

#[tokio::test]
async fn update_rechecks_the_merged_listing() {
    let app = TestApp::new().await;
    app.sign_up_seamstress().await;
    let catalog = app.storefront.catalog();
    let mut input = listing("Avental", dec!(40.00));
    input.promotional_price = Some(dec!(35.00));
    let created = catalog.create_product(input).await.unwrap();

    // New price below the running promotion
    assert_matches!(
        catalog
            .update_product(
                created.id,
                ProductPatch {
                    price: Some(dec!(30.00)),
                    ..Default::default()
                },
            )
            .await,
        Err(ServiceError::ValidationFailed(_))
    );
    let stored = app.storefront.products().get_product(created.id).await.unwrap();
    assert_eq!(stored.product.price, dec!(40.00));
}

#[tokio::test]
async fn listings_belong_to_their_seamstress() {
    let app = TestApp::new().await;
    app.sign_up_seamstress().await;
    let created = app
        .storefront
        .catalog()
        .create_product(listing("Avental", dec!(40.00)))
        .await
        .unwrap();

    app.sign_up_seamstress().await;
    let catalog = app.storefront.catalog();
    assert_matches!(
        catalog
            .update_product(
                created.id,
                ProductPatch {
                    price: Some(dec!(1.00)),
                    ..Default::default()
                },
            )
            .await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        catalog.delete_product(created.id).await,
        Err(ServiceError::NotFound(_))
    );
    assert!(catalog.list_own().await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_product_hides_it_but_keeps_cart_lines() {
    let app = TestApp::new().await;
    let seamstress = app.sign_up_seamstress().await;
    let created = app
        .storefront
        .catalog()
        .create_product(listing("Avental", dec!(40.00)))
        .await
        .unwrap();

    app.sign_up_customer().await;
    app.storefront.cart().add_to_cart(created.id, 1).await.unwrap();
    let reader = app.storefront.products();
    reader.get_product(created.id).await.unwrap();

    app.auth
        .sign_in(&seamstress.email, "segredo123")
        .await
        .unwrap();
    app.storefront.catalog().delete_product(created.id).await.unwrap();

    assert_matches!(
        reader.get_product(created.id).await,
        Err(ServiceError::NotFound(_))
    );
    assert!(reader
        .list_active(ProductOrdering::Newest)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(CartLine::find().count(app.db.as_ref()).await.unwrap(), 1);
    assert_matches!(
        app.storefront.catalog().delete_product(created.id).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn catalog_hides_inactive_products_and_sorts_by_name() {
    let app = TestApp::new().await;
    app.seed_product("Saia", dec!(45.00)).await;
    app.seed_product("Avental", dec!(25.00)).await;
    app.seed_product_with("Colete", dec!(60.00), None, ProductStatus::Inactive)
        .await;

    let names: Vec<String> = app
        .storefront
        .products()
        .list_active(ProductOrdering::Name)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["Avental".to_string(), "Saia".to_string()]);
}

#[tokio::test]
async fn product_detail_carries_reviews_and_average() {
    let app = TestApp::new().await;
    let product = app.seed_product("Saia", dec!(45.00)).await;

    for rating in [5i16, 4, 4] {
        product_review::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            customer_id: Set(Uuid::new_v4()),
            rating: Set(rating),
            title: Set(None),
            comment: Set(Some("Acabamento caprichado".to_string())),
            created_at: Set(Utc::now()),
        }
        .insert(app.db.as_ref())
        .await
        .unwrap();
    }

    let detail = app.storefront.products().get_product(product.id).await.unwrap();
    assert_eq!(detail.reviews.len(), 3);
    assert_eq!(detail.average_rating, Some(dec!(4.33)));

    assert_matches!(
        app.storefront.products().get_product(Uuid::new_v4()).await,
        Err(ServiceError::NotFound(_))
    );
}
