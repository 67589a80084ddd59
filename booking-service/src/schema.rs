diesel::table! {
    price_tiers (id) {
        id -> Uuid,
        name -> Varchar,
        unit_price -> Numeric,
        currency -> Varchar,
    }
}

diesel::table! {
    seat_sections (id) {
        id -> Uuid,
        showtime_id -> Uuid,
        price_tier_id -> Uuid,
        available_seats -> Int4,
        is_active -> Bool,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        section_id -> Uuid,
        status -> Varchar,
        code -> Varchar,
        price -> Numeric,
        currency -> Varchar,
    }
}

diesel::table! {
    bookings (id) {
        id -> Uuid,
        user_id -> Uuid,
        status -> Varchar,
        total_amount -> Numeric,
        currency -> Varchar,
        expires_at -> Timestamptz,
        gateway_order_id -> Nullable<Varchar>,
        payment_method -> Nullable<Varchar>,
        external_payment_id -> Nullable<Varchar>,
        refund_id -> Nullable<Varchar>,
        refund_date -> Nullable<Timestamptz>,
        refund_reason -> Nullable<Text>,
        refund_initiated_by -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    booking_tickets (booking_id, ticket_id) {
        booking_id -> Uuid,
        ticket_id -> Uuid,
    }
}

diesel::table! {
    ticket_holds (ticket_id) {
        ticket_id -> Uuid,
        user_id -> Uuid,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    resource_locks (resource_key) {
        resource_key -> Varchar,
        token -> Varchar,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    dead_letters (id) {
        id -> Uuid,
        task_id -> Uuid,
        task_name -> Varchar,
        payload -> Jsonb,
        error -> Text,
        failed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    price_tiers,
    seat_sections,
    tickets,
    bookings,
    booking_tickets,
    ticket_holds,
    resource_locks,
    dead_letters,
);
