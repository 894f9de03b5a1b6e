//! Diesel schema for the fact inventory tables.

diesel::table! {
    use diesel::sql_types::*;

    host_facts (id) {
        id -> Uuid,
        #[max_length = 45]
        client_address -> Varchar,
        system_facts -> Jsonb,
        package_facts -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
