//! Macros for reducing boilerplate when defining entities
//!
//! These macros generate the [`Entity`](crate::core::entity::Entity)
//! implementation, the static table schema and the field registry for a
//! struct that the caller declares (with serde derives) themselves.

/// Implement [`Entity`](crate::core::entity::Entity) for a struct
///
/// `features` switches on the structural capabilities of the table. Each one
/// requires the matching struct fields and registers them for filtering:
///
/// | feature | required fields |
/// |---|---|
/// | `uuid` | `uuid: Uuid` |
/// | `timestamps` | `created_at: DateTime<Utc>`, `updated_at: DateTime<Utc>` |
/// | `soft_delete` | `deleted_at: Option<DateTime<Utc>>` |
///
/// `id: i64` is always required. `fields` lists the remaining filterable
/// columns with their types; columns left out (JSON blobs, secrets) are
/// still stored but cannot be filtered or sorted on.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Widget {
///     pub id: i64,
///     pub uuid: Uuid,
///     pub name: String,
///     pub price: f64,
///     pub created_at: DateTime<Utc>,
///     pub updated_at: DateTime<Utc>,
///     pub deleted_at: Option<DateTime<Utc>>,
/// }
///
/// impl_model!(
///     Widget,
///     table = "widgets",
///     features = [uuid, timestamps, soft_delete],
///     unique = ["name"],
///     fields = { name: String, price: f64 },
/// );
/// ```
#[macro_export]
macro_rules! impl_model {
    (@field $registry:ident, $type:ident, $field:ident : $field_type:ty) => {
        $registry.register($crate::core::field::FieldDef::new(
            stringify!($field),
            <$field_type as $crate::core::field::FieldType>::KIND,
            {
                fn get(model: &$type) -> $crate::core::field::FieldValue {
                    $crate::core::field::FieldType::to_field_value(&model.$field)
                }
                get
            },
        ))
    };

    (@feature_fields $registry:ident, $type:ident, uuid) => {
        $crate::impl_model!(@field $registry, $type, uuid: ::uuid::Uuid)
    };
    (@feature_fields $registry:ident, $type:ident, timestamps) => {{
        let with_created = $crate::impl_model!(
            @field $registry, $type, created_at: ::chrono::DateTime<::chrono::Utc>
        );
        $crate::impl_model!(
            @field with_created, $type, updated_at: ::chrono::DateTime<::chrono::Utc>
        )
    }};
    (@feature_fields $registry:ident, $type:ident, soft_delete) => {
        $crate::impl_model!(
            @field $registry, $type, deleted_at: Option<::chrono::DateTime<::chrono::Utc>>
        )
    };

    (@accessor uuid) => {
        fn uuid(&self) -> Option<::uuid::Uuid> {
            Some(self.uuid)
        }
    };
    (@accessor timestamps) => {};
    (@accessor soft_delete) => {
        fn deleted_at(&self) -> Option<::chrono::DateTime<::chrono::Utc>> {
            self.deleted_at
        }
    };

    (
        $type:ident,
        table = $table:literal
        $(, features = [ $( $feature:ident ),* $(,)? ] )?
        $(, unique = [ $( $unique:literal ),* $(,)? ] )?
        $(, fields = { $( $field:ident : $field_type:ty ),* $(,)? } )?
        $(,)?
    ) => {
        impl $crate::core::entity::Entity for $type {
            fn entity_name() -> &'static str {
                stringify!($type)
            }

            fn schema() -> &'static $crate::core::entity::TableSchema {
                static SCHEMA: $crate::core::entity::TableSchema =
                    $crate::core::entity::TableSchema::new($table)
                        $( $( .$feature() )* )?
                        .unique(&[ $( $( $unique ),* )? ]);
                &SCHEMA
            }

            fn fields() -> &'static $crate::core::field::FieldRegistry<Self> {
                static FIELDS: ::std::sync::OnceLock<$crate::core::field::FieldRegistry<$type>> =
                    ::std::sync::OnceLock::new();
                FIELDS.get_or_init(|| {
                    let registry = $crate::core::field::FieldRegistry::new();
                    let registry = $crate::impl_model!(@field registry, $type, id: i64);
                    $( $(
                        let registry = $crate::impl_model!(@feature_fields registry, $type, $feature);
                    )* )?
                    $( $(
                        let registry = $crate::impl_model!(@field registry, $type, $field: $field_type);
                    )* )?
                    registry
                })
            }

            fn id(&self) -> i64 {
                self.id
            }

            $( $( $crate::impl_model!(@accessor $feature); )* )?
        }
    };
}
