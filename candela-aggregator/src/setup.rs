use candela_shared::{timeframes::timeframes, window::TimeWindow};
use clickhouse::Client;
use eyre::Result;
use tracing::info;

pub const BASE_TABLE: &str = "ohlc_table";

/// Creates the base table plus, for every non-1-second timeframe, a rollup
/// table and the materialized view that folds the 1-second rows into it.
/// Everything is `IF NOT EXISTS`; reruns are harmless.
pub async fn ensure_schema(client: &Client) -> Result<()> {
    client
        .query(
            "CREATE TABLE IF NOT EXISTS ohlc_table
            (
                symbol String,
                timeframe_size UInt32,
                timeframe_unit String,
                time UInt64,
                open Float64,
                high Float64,
                low Float64,
                close Float64
            )
            ENGINE = MergeTree()
            ORDER BY (symbol, time)",
        )
        .execute()
        .await?;

    for tf in timeframes() {
        if tf.is_one_second() {
            continue;
        }
        create_rollup(client, tf).await?;
    }

    info!("clickhouse schema ready");
    Ok(())
}

/// Rollup rows are aggregate-function states over the 1-second base rows;
/// `argMin`/`argMax` on `time` pick the opening and closing prices.
async fn create_rollup(client: &Client, tf: TimeWindow) -> Result<()> {
    let table = format!("ohlc_{tf}");
    let unit = tf.unit.to_string().to_uppercase();

    client
        .query(&format!(
            "CREATE TABLE IF NOT EXISTS {table}
            (
                symbol String,
                time UInt64,
                open AggregateFunction(argMin, Float64, UInt64),
                high AggregateFunction(max, Float64),
                low AggregateFunction(min, Float64),
                close AggregateFunction(argMax, Float64, UInt64)
            )
            ENGINE = MergeTree()
            ORDER BY (symbol, time)
            TTL fromUnixTimestamp(time) + INTERVAL {ttl} {unit}",
            ttl = 2 * tf.size,
        ))
        .execute()
        .await?;

    client
        .query(&format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {table}_mv
            TO {table}
            AS SELECT
                symbol,
                CAST(
                    toUnixTimestamp(
                        toStartOfInterval(
                            fromUnixTimestamp(time),
                            INTERVAL {size} {unit}
                        )
                    ) AS UInt64
                ) AS time,
                argMinState(open, time) AS open,
                maxState(high) AS high,
                minState(low) AS low,
                argMaxState(close, time) AS close
            FROM {base}
            WHERE timeframe_size = 1
                AND timeframe_unit = 'second'
            GROUP BY symbol, time",
            size = tf.size,
            base = BASE_TABLE,
        ))
        .execute()
        .await?;

    Ok(())
}
