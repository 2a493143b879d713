use crate::db::Db;

/// Ordered list of DDL statements to ensure the tracking schema exists.
/// Every statement is idempotent (`IF NOT EXISTS` / `OR REPLACE`) so safe to
/// run on every startup. High-volume telemetry tables key on
/// `(imei, gps_time)` with gps_time stored as naive UTC.
const MIGRATIONS: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS postgis",

    // ── Telemetry ──
    r"CREATE TABLE IF NOT EXISTS trackdata (
    imei                 BIGINT NOT NULL,
    gps_time             TIMESTAMP NOT NULL,
    server_time          TIMESTAMP NOT NULL,
    latitude             DOUBLE PRECISION NOT NULL DEFAULT 0,
    longitude            DOUBLE PRECISION NOT NULL DEFAULT 0,
    altitude             INTEGER NOT NULL DEFAULT 0,
    angle                INTEGER NOT NULL DEFAULT 0,
    satellites           INTEGER NOT NULL DEFAULT 0,
    speed                INTEGER NOT NULL DEFAULT 0,
    status               VARCHAR(100) NOT NULL DEFAULT 'Normal',
    vendor               VARCHAR(50) NOT NULL DEFAULT 'teltonika',
    ignition             BOOLEAN,
    driver_seatbelt      BOOLEAN,
    passenger_seatbelt   BOOLEAN,
    door_status          BOOLEAN,
    passenger_seat       DOUBLE PRECISION,
    main_battery         DOUBLE PRECISION,
    battery_voltage      DOUBLE PRECISION,
    fuel                 DOUBLE PRECISION,
    dallas_temperature_1 DOUBLE PRECISION,
    dallas_temperature_2 DOUBLE PRECISION,
    dallas_temperature_3 DOUBLE PRECISION,
    dallas_temperature_4 DOUBLE PRECISION,
    ble_temperature_1    DOUBLE PRECISION,
    ble_temperature_2    DOUBLE PRECISION,
    ble_temperature_3    DOUBLE PRECISION,
    ble_temperature_4    DOUBLE PRECISION,
    ble_humidity_1       INTEGER,
    ble_humidity_2       INTEGER,
    ble_humidity_3       INTEGER,
    ble_humidity_4       INTEGER,
    green_driving_value  DOUBLE PRECISION,
    dynamic_io           JSONB NOT NULL DEFAULT '{}',
    is_valid             INTEGER NOT NULL DEFAULT 1,
    reference_id         INTEGER,
    distance             DOUBLE PRECISION,
    created_at           TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    PRIMARY KEY (imei, gps_time)
)",
    "CREATE INDEX IF NOT EXISTS idx_trackdata_gps_time ON trackdata (gps_time)",

    r"CREATE TABLE IF NOT EXISTS alarms (
    id                   BIGSERIAL,
    imei                 BIGINT NOT NULL,
    gps_time             TIMESTAMP NOT NULL,
    server_time          TIMESTAMP NOT NULL,
    latitude             DOUBLE PRECISION NOT NULL DEFAULT 0,
    longitude            DOUBLE PRECISION NOT NULL DEFAULT 0,
    altitude             INTEGER NOT NULL DEFAULT 0,
    angle                INTEGER NOT NULL DEFAULT 0,
    satellites           INTEGER NOT NULL DEFAULT 0,
    speed                INTEGER NOT NULL DEFAULT 0,
    status               VARCHAR(100) NOT NULL DEFAULT 'Normal',
    vendor               VARCHAR(50) NOT NULL DEFAULT 'teltonika',
    ignition             BOOLEAN,
    driver_seatbelt      BOOLEAN,
    passenger_seatbelt   BOOLEAN,
    door_status          BOOLEAN,
    passenger_seat       DOUBLE PRECISION,
    main_battery         DOUBLE PRECISION,
    battery_voltage      DOUBLE PRECISION,
    fuel                 DOUBLE PRECISION,
    dallas_temperature_1 DOUBLE PRECISION,
    dallas_temperature_2 DOUBLE PRECISION,
    dallas_temperature_3 DOUBLE PRECISION,
    dallas_temperature_4 DOUBLE PRECISION,
    ble_temperature_1    DOUBLE PRECISION,
    ble_temperature_2    DOUBLE PRECISION,
    ble_temperature_3    DOUBLE PRECISION,
    ble_temperature_4    DOUBLE PRECISION,
    ble_humidity_1       INTEGER,
    ble_humidity_2       INTEGER,
    ble_humidity_3       INTEGER,
    ble_humidity_4       INTEGER,
    green_driving_value  DOUBLE PRECISION,
    dynamic_io           JSONB NOT NULL DEFAULT '{}',
    is_valid             INTEGER NOT NULL DEFAULT 1,
    reference_id         INTEGER,
    distance             DOUBLE PRECISION,
    is_sms               SMALLINT NOT NULL DEFAULT 0,
    is_email             SMALLINT NOT NULL DEFAULT 0,
    is_call              SMALLINT NOT NULL DEFAULT 0,
    priority             SMALLINT NOT NULL DEFAULT 0,
    category             VARCHAR(100),
    scheduled_at         TIMESTAMP,
    state                JSONB NOT NULL DEFAULT '{}',
    sms_sent_at          TIMESTAMP,
    email_sent_at        TIMESTAMP,
    call_sent_at         TIMESTAMP,
    retry_count          INTEGER NOT NULL DEFAULT 0,
    created_at           TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    PRIMARY KEY (imei, gps_time)
)",
    "CREATE INDEX IF NOT EXISTS idx_alarms_id ON alarms (id)",
    "CREATE INDEX IF NOT EXISTS idx_alarms_gps_time ON alarms (gps_time)",

    r"CREATE TABLE IF NOT EXISTS events (
    imei                 BIGINT NOT NULL,
    gps_time             TIMESTAMP NOT NULL,
    server_time          TIMESTAMP NOT NULL,
    latitude             DOUBLE PRECISION NOT NULL DEFAULT 0,
    longitude            DOUBLE PRECISION NOT NULL DEFAULT 0,
    altitude             INTEGER NOT NULL DEFAULT 0,
    angle                INTEGER NOT NULL DEFAULT 0,
    satellites           INTEGER NOT NULL DEFAULT 0,
    speed                INTEGER NOT NULL DEFAULT 0,
    status               VARCHAR(100) NOT NULL DEFAULT 'Normal',
    vendor               VARCHAR(50) NOT NULL DEFAULT 'teltonika',
    ignition             BOOLEAN,
    driver_seatbelt      BOOLEAN,
    passenger_seatbelt   BOOLEAN,
    door_status          BOOLEAN,
    passenger_seat       DOUBLE PRECISION,
    main_battery         DOUBLE PRECISION,
    battery_voltage      DOUBLE PRECISION,
    fuel                 DOUBLE PRECISION,
    dallas_temperature_1 DOUBLE PRECISION,
    dallas_temperature_2 DOUBLE PRECISION,
    dallas_temperature_3 DOUBLE PRECISION,
    dallas_temperature_4 DOUBLE PRECISION,
    ble_temperature_1    DOUBLE PRECISION,
    ble_temperature_2    DOUBLE PRECISION,
    ble_temperature_3    DOUBLE PRECISION,
    ble_temperature_4    DOUBLE PRECISION,
    ble_humidity_1       INTEGER,
    ble_humidity_2       INTEGER,
    ble_humidity_3       INTEGER,
    ble_humidity_4       INTEGER,
    green_driving_value  DOUBLE PRECISION,
    dynamic_io           JSONB NOT NULL DEFAULT '{}',
    is_valid             INTEGER NOT NULL DEFAULT 1,
    reference_id         INTEGER,
    distance             DOUBLE PRECISION,
    photo_url            TEXT,
    video_url            TEXT,
    created_at           TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    PRIMARY KEY (imei, gps_time)
)",

    // ── Hot row per device. Consumer owns the mirror columns, the metric
    //    engine owns the state columns; neither writer names the other's set.
    r"CREATE TABLE IF NOT EXISTS laststatus (
    imei                     BIGINT PRIMARY KEY,
    gps_time                 TIMESTAMP,
    server_time              TIMESTAMP,
    latitude                 DOUBLE PRECISION,
    longitude                DOUBLE PRECISION,
    altitude                 INTEGER,
    angle                    INTEGER,
    satellites               INTEGER,
    speed                    INTEGER,
    reference_id             INTEGER,
    distance                 DOUBLE PRECISION,
    vendor                   VARCHAR(50) NOT NULL DEFAULT 'teltonika',
    status                   VARCHAR(100),
    ignition                 BOOLEAN,
    driver_seatbelt          BOOLEAN,
    passenger_seatbelt       BOOLEAN,
    door_status              BOOLEAN,
    passenger_seat           DOUBLE PRECISION,
    main_battery             DOUBLE PRECISION,
    battery_voltage          DOUBLE PRECISION,
    fuel                     DOUBLE PRECISION,
    dallas_temperature_1     DOUBLE PRECISION,
    dallas_temperature_2     DOUBLE PRECISION,
    dallas_temperature_3     DOUBLE PRECISION,
    dallas_temperature_4     DOUBLE PRECISION,
    ble_temperature_1        DOUBLE PRECISION,
    ble_temperature_2        DOUBLE PRECISION,
    ble_temperature_3        DOUBLE PRECISION,
    ble_temperature_4        DOUBLE PRECISION,
    ble_humidity_1           INTEGER,
    ble_humidity_2           INTEGER,
    ble_humidity_3           INTEGER,
    ble_humidity_4           INTEGER,
    green_driving_value      DOUBLE PRECISION,
    dynamic_io               JSONB,
    is_valid                 INTEGER,
    updateddate              TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    vehicle_state            VARCHAR(20),
    last_processed_gps_time  TIMESTAMP,
    idle_start_time          TIMESTAMP,
    speeding_start_time      TIMESTAMP,
    speeding_max_speed       INTEGER,
    last_violation_time      TIMESTAMP,
    last_violation_type      VARCHAR(60),
    temp_violation_start     TIMESTAMP,
    humidity_violation_start TIMESTAMP,
    prev_temp_value          DOUBLE PRECISION,
    prev_fuel_level          DOUBLE PRECISION,
    trip_in_progress         BOOLEAN NOT NULL DEFAULT FALSE,
    current_trip_id          BIGINT,
    current_fence_ids        JSONB,
    driving_session_start    TIMESTAMP,
    driving_session_distance DOUBLE PRECISION,
    rest_start_time          TIMESTAMP,
    seatbelt_unbuckled_start TIMESTAMP,
    seatbelt_unbuckled_distance DOUBLE PRECISION,
    stoppage_start_time      TIMESTAMP,
    stoppage_start_lat       DOUBLE PRECISION,
    stoppage_start_lon       DOUBLE PRECISION,
    last_distance_km         DOUBLE PRECISION
)",

    r"CREATE TABLE IF NOT EXISTS laststatus_history (
    imei           BIGINT NOT NULL,
    gps_time       TIMESTAMP NOT NULL,
    previous_state VARCHAR(20),
    new_state      VARCHAR(20) NOT NULL,
    created_at     TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    PRIMARY KEY (imei, gps_time)
)",

    r"CREATE TABLE IF NOT EXISTS metric_events (
    id              BIGSERIAL PRIMARY KEY,
    imei            BIGINT NOT NULL,
    gps_time        TIMESTAMP NOT NULL,
    event_category  VARCHAR(30) NOT NULL,
    event_type      VARCHAR(60) NOT NULL,
    event_value     DOUBLE PRECISION,
    threshold_value DOUBLE PRECISION,
    duration_sec    BIGINT,
    severity        VARCHAR(20),
    latitude        DOUBLE PRECISION,
    longitude       DOUBLE PRECISION,
    fence_id        BIGINT,
    trip_id         BIGINT,
    metadata        JSONB NOT NULL DEFAULT '{}',
    formula_version VARCHAR(20),
    created_at      TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    "CREATE INDEX IF NOT EXISTS idx_metric_events_imei_time ON metric_events (imei, gps_time)",
    "CREATE INDEX IF NOT EXISTS idx_metric_events_category ON metric_events (event_category, gps_time)",
    "CREATE INDEX IF NOT EXISTS idx_metric_events_fence ON metric_events (fence_id) WHERE fence_id IS NOT NULL",

    // ── Trips ──
    r"CREATE TABLE IF NOT EXISTS trip (
    trip_id           BIGSERIAL PRIMARY KEY,
    vehicle_id        BIGINT NOT NULL,
    trip_type         VARCHAR(20) NOT NULL,
    status            VARCHAR(20) NOT NULL DEFAULT 'Ongoing',
    creation_mode     VARCHAR(20) NOT NULL DEFAULT 'Automatic',
    trip_start_time   TIMESTAMP NOT NULL,
    trip_end_time     TIMESTAMP,
    start_latitude    DOUBLE PRECISION,
    start_longitude   DOUBLE PRECISION,
    end_latitude      DOUBLE PRECISION,
    end_longitude     DOUBLE PRECISION,
    total_distance_km DOUBLE PRECISION NOT NULL DEFAULT 0,
    total_duration_sec BIGINT NOT NULL DEFAULT 0,
    fuel_consumed     DOUBLE PRECISION,
    created_at        TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    "CREATE INDEX IF NOT EXISTS idx_trip_vehicle_status ON trip (vehicle_id, status)",

    r"CREATE TABLE IF NOT EXISTS trip_stoppage_log (
    id              BIGSERIAL PRIMARY KEY,
    trip_id         BIGINT NOT NULL,
    stoppage_type   VARCHAR(20) NOT NULL DEFAULT 'Stop',
    start_time      TIMESTAMP NOT NULL,
    end_time        TIMESTAMP NOT NULL,
    latitude        DOUBLE PRECISION,
    longitude       DOUBLE PRECISION,
    inside_fence_id BIGINT
)",
    "CREATE INDEX IF NOT EXISTS idx_stoppage_trip ON trip_stoppage_log (trip_id)",

    r"CREATE TABLE IF NOT EXISTS trip_route_extension (
    trip_id          BIGINT PRIMARY KEY,
    route_id         BIGINT NOT NULL,
    deviation_count  INTEGER NOT NULL DEFAULT 0,
    deviation_status VARCHAR(20)
)",
    r"CREATE TABLE IF NOT EXISTS trip_round_extension (
    trip_id                  BIGINT PRIMARY KEY,
    upload_id                BIGINT,
    planned_fence_id         BIGINT NOT NULL,
    destination_arrival_time TIMESTAMP,
    destination_exit_time    TIMESTAMP,
    deviation_status         VARCHAR(20),
    time_compliance          VARCHAR(20)
)",
    r"CREATE TABLE IF NOT EXISTS trip_fence_wise_extension (
    trip_id                  BIGINT PRIMARY KEY,
    origin_fence_id          BIGINT NOT NULL,
    destination_fence_id     BIGINT NOT NULL,
    source_exit_time         TIMESTAMP,
    destination_arrival_time TIMESTAMP
)",

    // ── Geography ──
    r"CREATE TABLE IF NOT EXISTS fence (
    fence_id        BIGSERIAL PRIMARY KEY,
    client_id       BIGINT NOT NULL,
    name            VARCHAR(200) NOT NULL DEFAULT '',
    polygon         GEOMETRY(POLYGON, 4326),
    buffer_distance INTEGER NOT NULL DEFAULT 50,
    active          BOOLEAN NOT NULL DEFAULT TRUE
)",
    "CREATE INDEX IF NOT EXISTS idx_fence_polygon ON fence USING GIST (polygon)",
    r"CREATE TABLE IF NOT EXISTS road (
    id          BIGSERIAL PRIMARY KEY,
    road_type   VARCHAR(30) NOT NULL,
    speed_limit INTEGER,
    geom        GEOMETRY(LINESTRING, 4326)
)",
    "CREATE INDEX IF NOT EXISTS idx_road_geom ON road USING GIST (geom)",
    r"CREATE TABLE IF NOT EXISTS route (
    route_id BIGSERIAL PRIMARY KEY,
    name     VARCHAR(200) NOT NULL DEFAULT '',
    polyline GEOMETRY(LINESTRING, 4326)
)",
    "CREATE INDEX IF NOT EXISTS idx_route_polyline ON route USING GIST (polyline)",
    r"CREATE TABLE IF NOT EXISTS route_assignment (
    id         BIGSERIAL PRIMARY KEY,
    vehicle_id BIGINT NOT NULL,
    route_id   BIGINT NOT NULL,
    active     BOOLEAN NOT NULL DEFAULT TRUE
)",
    r"CREATE TABLE IF NOT EXISTS upload_sheet (
    upload_id            BIGSERIAL PRIMARY KEY,
    vehicle_id           BIGINT NOT NULL,
    destination_fence_id BIGINT,
    start_ts             TIMESTAMP NOT NULL,
    consumed             BOOLEAN NOT NULL DEFAULT FALSE
)",
    r"CREATE TABLE IF NOT EXISTS location_reference (
    id        BIGSERIAL PRIMARY KEY,
    name      VARCHAR(200) NOT NULL,
    latitude  DOUBLE PRECISION NOT NULL,
    longitude DOUBLE PRECISION NOT NULL
)",
    r"CREATE TABLE IF NOT EXISTS geocode_cache (
    id         BIGSERIAL PRIMARY KEY,
    latitude   DOUBLE PRECISION NOT NULL,
    longitude  DOUBLE PRECISION NOT NULL,
    address    TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",

    // ── Fleet registry ──
    r"CREATE TABLE IF NOT EXISTS client (
    client_id BIGSERIAL PRIMARY KEY,
    name      VARCHAR(200) NOT NULL DEFAULT ''
)",
    r"CREATE TABLE IF NOT EXISTS vehicle (
    vehicle_id   BIGSERIAL PRIMARY KEY,
    client_id    BIGINT NOT NULL,
    plate_number VARCHAR(50) NOT NULL DEFAULT ''
)",
    r"CREATE TABLE IF NOT EXISTS tracker (
    imei                BIGINT PRIMARY KEY,
    vehicle_id          BIGINT,
    has_fuel_sensor     BOOLEAN NOT NULL DEFAULT FALSE,
    has_temp_sensor     BOOLEAN NOT NULL DEFAULT FALSE,
    has_humidity_sensor BOOLEAN NOT NULL DEFAULT FALSE,
    has_seatbelt_sensor BOOLEAN NOT NULL DEFAULT FALSE,
    has_mdvr            BOOLEAN NOT NULL DEFAULT FALSE
)",
    r"CREATE TABLE IF NOT EXISTS unit (
    imei     BIGINT PRIMARY KEY,
    sim_no   VARCHAR(30),
    modem_id BIGINT
)",
    r"CREATE TABLE IF NOT EXISTS unit_io_mapping (
    id      BIGSERIAL PRIMARY KEY,
    imei    BIGINT NOT NULL,
    io_key  VARCHAR(50) NOT NULL,
    io_name VARCHAR(100) NOT NULL
)",
    r"CREATE TABLE IF NOT EXISTS calibration (
    id         BIGSERIAL PRIMARY KEY,
    vehicle_id BIGINT NOT NULL,
    raw_min    DOUBLE PRECISION NOT NULL,
    raw_max    DOUBLE PRECISION NOT NULL,
    liters_min DOUBLE PRECISION NOT NULL,
    liters_max DOUBLE PRECISION NOT NULL
)",
    "CREATE INDEX IF NOT EXISTS idx_calibration_vehicle ON calibration (vehicle_id, raw_min)",

    // ── Config tiers ──
    r"CREATE TABLE IF NOT EXISTS system_config (
    config_key   VARCHAR(60) PRIMARY KEY,
    config_value VARCHAR(200) NOT NULL
)",
    r"CREATE TABLE IF NOT EXISTS client_config (
    client_id    BIGINT NOT NULL,
    config_key   VARCHAR(60) NOT NULL,
    config_value VARCHAR(200) NOT NULL,
    PRIMARY KEY (client_id, config_key)
)",
    r"CREATE TABLE IF NOT EXISTS tracker_config (
    imei         BIGINT NOT NULL,
    config_key   VARCHAR(60) NOT NULL,
    config_value VARCHAR(200) NOT NULL,
    PRIMARY KEY (imei, config_key)
)",
    r"CREATE TABLE IF NOT EXISTS score_weights (
    id           BIGSERIAL PRIMARY KEY,
    client_id    BIGINT,
    weight_key   VARCHAR(60) NOT NULL,
    weight_value DOUBLE PRECISION NOT NULL
)",

    // ── Dedup / retry bookkeeping ──
    r"CREATE TABLE IF NOT EXISTS processed_message_ids (
    message_id   VARCHAR(120) PRIMARY KEY,
    processed_at TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    r"CREATE TABLE IF NOT EXISTS message_retry_counts (
    message_id       VARCHAR(120) PRIMARY KEY,
    queue_name       VARCHAR(60) NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    last_error       VARCHAR(500),
    first_attempt_at TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    last_attempt_at  TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    r"CREATE TABLE IF NOT EXISTS metric_engine_processed_messages (
    message_id   VARCHAR(120) PRIMARY KEY,
    processed_at TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    r"CREATE TABLE IF NOT EXISTS metric_engine_message_retries (
    message_id       VARCHAR(120) PRIMARY KEY,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    last_error       VARCHAR(500),
    first_attempt_at TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    last_attempt_at  TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    r"CREATE TABLE IF NOT EXISTS invalid_data_queue (
    id                BIGSERIAL PRIMARY KEY,
    source_queue      VARCHAR(60) NOT NULL,
    message_id        VARCHAR(120),
    raw_payload       JSONB NOT NULL,
    validation_errors JSONB NOT NULL,
    imei              VARCHAR(30),
    created_at        TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    reviewed_at       TIMESTAMP,
    reviewed_by       VARCHAR(100),
    action_taken      VARCHAR(100),
    notes             TEXT
)",

    // ── Recalculation ──
    r"CREATE TABLE IF NOT EXISTS config_change_log (
    id          BIGSERIAL PRIMARY KEY,
    table_name  VARCHAR(60) NOT NULL,
    record_key  VARCHAR(100),
    config_key  VARCHAR(60),
    processed   BOOLEAN NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    "CREATE INDEX IF NOT EXISTS idx_config_change_pending ON config_change_log (processed, created_at)",
    r"CREATE TABLE IF NOT EXISTS recalculation_queue (
    id               BIGSERIAL PRIMARY KEY,
    job_type         VARCHAR(30) NOT NULL,
    trigger_type     VARCHAR(30) NOT NULL DEFAULT 'config_change',
    status           VARCHAR(20) NOT NULL DEFAULT 'PENDING',
    priority         INTEGER NOT NULL DEFAULT 5,
    scope_imei       BIGINT,
    scope_client_id  BIGINT,
    scope_vehicle_id BIGINT,
    scope_fence_id   BIGINT,
    scope_date_from  TIMESTAMP,
    scope_date_to    TIMESTAMP,
    config_change_id BIGINT,
    reason           TEXT,
    rows_affected    BIGINT,
    error_message    TEXT,
    created_at       TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    started_at       TIMESTAMP,
    completed_at     TIMESTAMP
)",
    "CREATE INDEX IF NOT EXISTS idx_recalc_status ON recalculation_queue (status, priority, created_at)",
    r"CREATE TABLE IF NOT EXISTS formula_version_registry (
    metric_name VARCHAR(60) PRIMARY KEY,
    version     VARCHAR(20) NOT NULL,
    updated_at  TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",

    // Notify the recalculation worker on any user-visible config edit. The
    // trigger also appends the audit row so the poll fallback sees edits made
    // while no listener was connected. record_key is chosen per table: the
    // worker reads it back as the job scope (fence rows must key by fence_id,
    // never by the fence's client_id).
    r"CREATE OR REPLACE FUNCTION notify_config_change() RETURNS trigger AS $$
DECLARE
    rec JSONB := to_jsonb(NEW);
    key TEXT;
BEGIN
    key := CASE TG_TABLE_NAME
        WHEN 'fence' THEN rec->>'fence_id'
        WHEN 'calibration' THEN rec->>'vehicle_id'
        WHEN 'tracker_config' THEN rec->>'imei'
        WHEN 'client_config' THEN rec->>'client_id'
        WHEN 'score_weights' THEN rec->>'client_id'
        ELSE COALESCE(rec->>'imei', rec->>'client_id', rec->>'vehicle_id', rec->>'fence_id', rec->>'id')
    END;
    INSERT INTO config_change_log (table_name, record_key, config_key)
    VALUES (TG_TABLE_NAME, key, rec->>'config_key');
    PERFORM pg_notify('config_change', TG_TABLE_NAME);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql",
    "DROP TRIGGER IF EXISTS trg_tracker_config_change ON tracker_config",
    "CREATE TRIGGER trg_tracker_config_change AFTER INSERT OR UPDATE ON tracker_config FOR EACH ROW EXECUTE FUNCTION notify_config_change()",
    "DROP TRIGGER IF EXISTS trg_client_config_change ON client_config",
    "CREATE TRIGGER trg_client_config_change AFTER INSERT OR UPDATE ON client_config FOR EACH ROW EXECUTE FUNCTION notify_config_change()",
    "DROP TRIGGER IF EXISTS trg_system_config_change ON system_config",
    "CREATE TRIGGER trg_system_config_change AFTER INSERT OR UPDATE ON system_config FOR EACH ROW EXECUTE FUNCTION notify_config_change()",
    "DROP TRIGGER IF EXISTS trg_calibration_change ON calibration",
    "CREATE TRIGGER trg_calibration_change AFTER INSERT OR UPDATE ON calibration FOR EACH ROW EXECUTE FUNCTION notify_config_change()",
    "DROP TRIGGER IF EXISTS trg_fence_change ON fence",
    "CREATE TRIGGER trg_fence_change AFTER INSERT OR UPDATE ON fence FOR EACH ROW EXECUTE FUNCTION notify_config_change()",
    "DROP TRIGGER IF EXISTS trg_score_weights_change ON score_weights",
    "CREATE TRIGGER trg_score_weights_change AFTER INSERT OR UPDATE ON score_weights FOR EACH ROW EXECUTE FUNCTION notify_config_change()",

    // ── Camera + CMS ──
    r"CREATE TABLE IF NOT EXISTS cms_servers (
    id                 BIGSERIAL PRIMARY KEY,
    name               VARCHAR(100) NOT NULL,
    base_url           VARCHAR(300) NOT NULL,
    username           VARCHAR(100) NOT NULL,
    password_encrypted VARCHAR(500) NOT NULL,
    timezone           VARCHAR(40) NOT NULL DEFAULT '+00:00',
    download_port      INTEGER,
    enabled            BOOLEAN NOT NULL DEFAULT TRUE
)",
    r"CREATE TABLE IF NOT EXISTS camera_alarm_config (
    imei       BIGINT NOT NULL,
    event_type VARCHAR(100) NOT NULL,
    enabled    BOOLEAN NOT NULL DEFAULT TRUE,
    is_alarm   SMALLINT NOT NULL DEFAULT 0,
    is_sms     SMALLINT NOT NULL DEFAULT 0,
    is_email   SMALLINT NOT NULL DEFAULT 0,
    is_call    SMALLINT NOT NULL DEFAULT 0,
    priority   SMALLINT NOT NULL DEFAULT 5,
    start_time TIME NOT NULL DEFAULT '00:00',
    end_time   TIME NOT NULL DEFAULT '23:59',
    PRIMARY KEY (imei, event_type)
)",
    r"CREATE TABLE IF NOT EXISTS metrics_alarm_config (
    imei       BIGINT NOT NULL,
    event_type VARCHAR(100) NOT NULL,
    enabled    BOOLEAN NOT NULL DEFAULT TRUE,
    is_alarm   SMALLINT NOT NULL DEFAULT 1,
    PRIMARY KEY (imei, event_type)
)",

    // ── SMS gateway ──
    r"CREATE TABLE IF NOT EXISTS command_outbox (
    id           BIGSERIAL PRIMARY KEY,
    imei         BIGINT,
    sim_no       VARCHAR(30) NOT NULL,
    command_text TEXT NOT NULL,
    config_id    BIGINT,
    user_id      BIGINT,
    send_method  VARCHAR(10) NOT NULL DEFAULT 'sms',
    retry_count  INTEGER NOT NULL DEFAULT 0,
    created_at   TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    r"CREATE TABLE IF NOT EXISTS command_sent (
    id            BIGSERIAL PRIMARY KEY,
    imei          BIGINT,
    sim_no        VARCHAR(30) NOT NULL,
    command_text  TEXT NOT NULL,
    config_id     BIGINT,
    user_id       BIGINT,
    send_method   VARCHAR(10) NOT NULL DEFAULT 'sms',
    status        VARCHAR(20) NOT NULL DEFAULT 'sent',
    response_text TEXT,
    error_message TEXT,
    modem_id      BIGINT,
    modem_name    VARCHAR(100),
    created_at    TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    sent_at       TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    "CREATE INDEX IF NOT EXISTS idx_command_sent_match ON command_sent (sim_no, status, sent_at DESC)",
    r"CREATE TABLE IF NOT EXISTS command_inbox (
    id           BIGSERIAL PRIMARY KEY,
    sim_no       VARCHAR(30) NOT NULL,
    imei         BIGINT,
    message_text TEXT NOT NULL,
    received_at  TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC')
)",
    r"CREATE TABLE IF NOT EXISTS command_history (
    id           BIGSERIAL PRIMARY KEY,
    imei         BIGINT,
    sim_no       VARCHAR(30) NOT NULL,
    direction    VARCHAR(10) NOT NULL,
    command_text TEXT NOT NULL,
    config_id    BIGINT,
    status       VARCHAR(20) NOT NULL,
    send_method  VARCHAR(10) NOT NULL DEFAULT 'sms',
    user_id      BIGINT,
    modem_id     BIGINT,
    modem_name   VARCHAR(100),
    created_at   TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    sent_at      TIMESTAMP
)",
    "CREATE INDEX IF NOT EXISTS idx_command_history_dedup ON command_history (sim_no, direction, created_at DESC)",
    r"CREATE TABLE IF NOT EXISTS alarms_sms_modems (
    id                 BIGSERIAL PRIMARY KEY,
    name               VARCHAR(100) NOT NULL,
    host               VARCHAR(200) NOT NULL,
    username           VARCHAR(100) NOT NULL,
    password_encrypted VARCHAR(500) NOT NULL,
    modem_id           VARCHAR(20) NOT NULL DEFAULT '1-1',
    enabled            BOOLEAN NOT NULL DEFAULT TRUE,
    health_status      VARCHAR(20) NOT NULL DEFAULT 'unknown',
    sms_sent_count     INTEGER NOT NULL DEFAULT 0,
    sms_limit          INTEGER NOT NULL DEFAULT 100,
    priority           INTEGER NOT NULL DEFAULT 0,
    allowed_services   TEXT[] NOT NULL DEFAULT ARRAY['alarms', 'commands']
)",
    r"CREATE TABLE IF NOT EXISTS alarms_sms_modem_usage (
    modem_id   BIGINT NOT NULL,
    usage_date DATE NOT NULL,
    sms_count  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (modem_id, usage_date)
)",

    // ── Materialised views exposed through the recalculation catalog ──
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS mv_daily_violations AS
SELECT imei,
       (gps_time)::DATE AS day,
       event_category,
       event_type,
       COUNT(*) AS violation_count
FROM metric_events
GROUP BY imei, (gps_time)::DATE, event_category, event_type",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_daily_violations ON mv_daily_violations (imei, day, event_category, event_type)",
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS mv_daily_mileage AS
SELECT imei,
       (gps_time)::DATE AS day,
       SUM(COALESCE(distance, 0)) / 1000.0 AS distance_km
FROM trackdata
GROUP BY imei, (gps_time)::DATE",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_daily_mileage ON mv_daily_mileage (imei, day)",
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS mv_daily_fuel_consumption AS
SELECT imei,
       (gps_time)::DATE AS day,
       SUM(CASE WHEN event_type = 'Fuel_Fill' THEN event_value ELSE 0 END) AS filled,
       SUM(CASE WHEN event_type = 'Fuel_Theft' THEN event_value ELSE 0 END) AS stolen
FROM metric_events
WHERE event_category = 'Fuel'
GROUP BY imei, (gps_time)::DATE",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_daily_fuel ON mv_daily_fuel_consumption (imei, day)",
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS mv_daily_fence_stats AS
SELECT imei,
       fence_id,
       (gps_time)::DATE AS day,
       COUNT(*) FILTER (WHERE event_type = 'Fence_Enter') AS entries,
       COUNT(*) FILTER (WHERE event_type = 'Fence_Exit') AS exits
FROM metric_events
WHERE event_category = 'Fence' AND fence_id IS NOT NULL
GROUP BY imei, fence_id, (gps_time)::DATE",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_daily_fence ON mv_daily_fence_stats (imei, fence_id, day)",
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS mv_weekly_driver_scores AS
SELECT imei,
       date_trunc('week', gps_time)::DATE AS week,
       COUNT(*) AS violation_count,
       COUNT(*) FILTER (WHERE event_category = 'Harsh') AS harsh_count,
       COUNT(*) FILTER (WHERE event_category = 'Speed') AS speed_count
FROM metric_events
GROUP BY imei, date_trunc('week', gps_time)::DATE",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_weekly_scores ON mv_weekly_driver_scores (imei, week)",
];

/// Run all migrations against the configured database.
pub async fn run(db: &Db) -> anyhow::Result<()> {
    let client = db.client().await?;
    for (i, sql) in MIGRATIONS.iter().enumerate() {
        if let Err(e) = client.batch_execute(sql).await {
            // PostGIS may be missing on dev databases; spatial features then
            // degrade to config fallbacks at runtime.
            if sql.contains("postgis") || sql.contains("GEOMETRY") || sql.contains("GIST") {
                tracing::warn!("migration {i} skipped (PostGIS unavailable?): {e}");
                continue;
            }
            anyhow::bail!("migration {i} failed: {e}\n{sql}");
        }
    }
    tracing::info!("schema migrations applied ({} statements)", MIGRATIONS.len());
    Ok(())
}
