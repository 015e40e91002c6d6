//! A single catalog query — cone search or identifier search — against the
//! IRSA NEOWISE catalog, over a caller-supplied
//! [`reqwest_middleware::ClientWithMiddleware`].
//!
//! The fetcher never builds its own client: the connection pool and its
//! transport-retry middleware are a value owned by the Ingest Driver and
//! handed down, so every worker shares the same pool instead of each
//! opening its own.

use std::collections::HashMap;

use nwlc_retry::Attempt;
use nwlc_types::RawCatalogRow;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use snafu::{Backtrace, IntoError, Snafu};

const CATALOG: &str = "neowiser_p1bs_psd";
const CONE_RADIUS_ARCSEC: f64 = 5.0;
const CONE_COLUMNS: &str = "ra,dec,allwise_cntr,w1mpro,w1sigmpro,w1rchi2,w1sat,w1sky,w2mpro,\
    w2sigmpro,w2rchi2,w2sat,w2sky,cc_flags,sso_flg,qi_fact,ph_qual,qual_frame,moon_masked,\
    saa_sep,mjd,scan_id";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("transport error: {}\nBacktrace:\n{}", source, backtrace))]
    Transport { source: reqwest_middleware::Error, backtrace: Backtrace },

    #[snafu(display("no rows matched the query\nBacktrace:\n{}", backtrace))]
    NotFound { backtrace: Backtrace },

    #[snafu(display("transient remote error ({}): {}\nBacktrace:\n{}", status, message, backtrace))]
    TransientRemote { status: u16, message: String, backtrace: Backtrace },

    #[snafu(display("permanent remote error ({}): {}\nBacktrace:\n{}", status, message, backtrace))]
    PermanentRemote { status: u16, message: String, backtrace: Backtrace },

    #[snafu(display("failed to parse catalog response: {}\nBacktrace:\n{}", message, backtrace))]
    ParseError { message: String, backtrace: Backtrace },
}

fn status_is_transient(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        429 | 500 | 502 | 503 | 504
    )
}

/// Which query shape to run. Chosen per work item: identifier search is
/// used only when an `allwise_id` is present and TAP mode is enabled;
/// callers fall back to `Cone` otherwise.
#[derive(Debug, Clone)]
pub enum FetchMode {
    Cone { ra: f64, dec: f64 },
    Identifier { allwise_id: String },
}

pub struct Fetcher {
    client: ClientWithMiddleware,
    base_url: String,
}

impl Fetcher {
    /// `base_url` defaults to the production IRSA host; tests override it
    /// with a `wiremock` server address. `client` is expected to already
    /// carry the transport-level retry middleware the Ingest Driver
    /// configures around its connection pool.
    pub fn new(client: ClientWithMiddleware) -> Fetcher {
        Fetcher { client, base_url: "https://irsa.ipac.caltech.edu".to_string() }
    }

    pub fn with_base_url(client: ClientWithMiddleware, base_url: impl Into<String>) -> Fetcher {
        Fetcher { client, base_url: base_url.into() }
    }

    /// Runs one query and returns the result already classified for the
    /// retry controller: a successful empty result is surfaced as
    /// `NotFound`, which the controller treats as terminal.
    pub async fn fetch(&self, mode: &FetchMode) -> Result<Vec<RawCatalogRow>, Attempt<Error>> {
        let rows = match mode {
            FetchMode::Cone { ra, dec } => self.fetch_cone(*ra, *dec).await,
            FetchMode::Identifier { allwise_id } => self.fetch_identifier(allwise_id).await,
        }?;

        if rows.is_empty() {
            return Err(Attempt::Terminal(NotFoundSnafu.build()));
        }
        Ok(rows)
    }

    async fn fetch_cone(&self, ra: f64, dec: f64) -> Result<Vec<RawCatalogRow>, Attempt<Error>> {
        let url = format!("{}/cgi-bin/Gator/nph-query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("catalog", CATALOG),
                ("spatial", "Cone"),
                ("objstr", &format!("{ra} {dec}")),
                ("radius", &CONE_RADIUS_ARCSEC.to_string()),
                ("radunits", "arcsec"),
                ("outfmt", "1"),
                ("selcols", CONE_COLUMNS),
            ])
            .send()
            .await
            .map_err(transport_attempt)?;

        let body = classify_and_read(response).await?;
        let fields = parse_ipac_table(&body).map_err(Attempt::Terminal)?;
        fields
            .iter()
            .map(row_from_fields)
            .collect::<Result<Vec<_>, Error>>()
            .map_err(Attempt::Terminal)
    }

    async fn fetch_identifier(&self, allwise_id: &str) -> Result<Vec<RawCatalogRow>, Attempt<Error>> {
        let adql = format!(
            "SELECT * FROM {CATALOG} WHERE designation = '{}' ORDER BY mjd",
            allwise_id.replace('\'', "''")
        );
        let url = format!("{}/TAP/sync", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("REQUEST", "doQuery"), ("LANG", "ADQL"), ("FORMAT", "csv"), ("QUERY", &adql)])
            .send()
            .await
            .map_err(transport_attempt)?;

        let body = classify_and_read(response).await?;
        let fields = parse_csv_table(&body).map_err(Attempt::Terminal)?;
        fields
            .iter()
            .map(row_from_fields)
            .collect::<Result<Vec<_>, Error>>()
            .map_err(Attempt::Terminal)
    }
}

/// Classifies a send failure as retryable or terminal. Transport-level
/// retries already ran inside the middleware client before this is ever
/// reached, so this only decides whether the Retry Controller gets another
/// attempt — `reqwest::Error` connect/timeout failures and any middleware
/// failure (e.g. the retry policy itself giving up) are treated as
/// retryable; anything else as terminal.
fn transport_attempt(source: reqwest_middleware::Error) -> Attempt<Error> {
    let retryable = match &source {
        reqwest_middleware::Error::Reqwest(e) => e.is_timeout() || e.is_connect(),
        reqwest_middleware::Error::Middleware(_) => true,
    };
    if retryable {
        Attempt::Retryable(TransportSnafu.into_error(source))
    } else {
        Attempt::Terminal(TransportSnafu.into_error(source))
    }
}

async fn classify_and_read(response: reqwest::Response) -> Result<String, Attempt<Error>> {
    let status = response.status();
    if status.is_success() {
        return response
            .text()
            .await
            .map_err(|e| transport_attempt(reqwest_middleware::Error::Reqwest(e)));
    }

    let message = response.text().await.unwrap_or_default();
    if status_is_transient(status) {
        Err(Attempt::Retryable(TransientRemoteSnafu { status: status.as_u16(), message }.build()))
    } else {
        Err(Attempt::Terminal(PermanentRemoteSnafu { status: status.as_u16(), message }.build()))
    }
}

/// Parses the classic IPAC ASCII table format Gator's `outfmt=1` emits:
/// `\`-prefixed keyword lines, `|`-delimited header/type/unit/null lines,
/// then whitespace-delimited data rows.
fn parse_ipac_table(text: &str) -> Result<Vec<HashMap<String, String>>, Error> {
    let mut header_line: Option<&str> = None;
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if line.starts_with('\\') || line.trim().is_empty() {
            continue;
        }
        if line.starts_with('|') {
            header_line.get_or_insert(line);
            continue;
        }
        data_lines.push(line);
    }

    let header_line = header_line.ok_or_else(|| {
        ParseSnafu { message: "response had no IPAC table header".to_string() }.build()
    })?;
    let names: Vec<String> =
        header_line.split('|').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();

    data_lines
        .into_iter()
        .map(|line| {
            let values: Vec<&str> = line.split_whitespace().collect();
            if values.len() != names.len() {
                return Err(ParseSnafu {
                    message: format!(
                        "row has {} fields, expected {} ({})",
                        values.len(),
                        names.len(),
                        line
                    ),
                }
                .build());
            }
            Ok(names.iter().cloned().zip(values.iter().map(|v| v.to_string())).collect())
        })
        .collect()
}

fn parse_csv_table(text: &str) -> Result<Vec<HashMap<String, String>>, Error> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ParseSnafu { message: e.to_string() }.build())?
        .iter()
        .map(|s| s.to_string())
        .collect();

    reader
        .records()
        .map(|record| {
            let record = record.map_err(|e| ParseSnafu { message: e.to_string() }.build())?;
            Ok(headers.iter().cloned().zip(record.iter().map(|v| v.to_string())).collect())
        })
        .collect()
}

fn field<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str, Error> {
    fields
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| ParseSnafu { message: format!("missing column {key}") }.build())
}

fn parse_f64(fields: &HashMap<String, String>, key: &str) -> Result<f64, Error> {
    field(fields, key)?
        .trim()
        .parse()
        .map_err(|_| ParseSnafu { message: format!("column {key} is not a number") }.build())
}

fn parse_opt_f64(fields: &HashMap<String, String>, key: &str) -> Result<Option<f64>, Error> {
    let raw = field(fields, key)?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| ParseSnafu { message: format!("column {key} is not a number") }.build())
}

fn parse_i64(fields: &HashMap<String, String>, key: &str) -> Result<i64, Error> {
    field(fields, key)?.trim().parse().map_err(|_| {
        ParseSnafu { message: format!("column {key} is not an integer") }.build()
    })
}

fn row_from_fields(fields: &HashMap<String, String>) -> Result<RawCatalogRow, Error> {
    let allwise_cntr = match field(fields, "allwise_cntr")?.trim() {
        "" | "null" => None,
        raw => Some(raw.parse().map_err(|_| {
            ParseSnafu { message: "column allwise_cntr is not an integer".to_string() }.build()
        })?),
    };

    Ok(RawCatalogRow {
        ra: parse_f64(fields, "ra")?,
        dec: parse_f64(fields, "dec")?,
        allwise_cntr,
        mjd: parse_f64(fields, "mjd")?,
        scan_id: field(fields, "scan_id")?.to_string(),
        cc_flags: field(fields, "cc_flags")?.to_string(),
        ph_qual: field(fields, "ph_qual")?.to_string(),
        moon_masked: field(fields, "moon_masked")?.to_string(),
        sso_flg: parse_i64(fields, "sso_flg")?,
        qi_fact: parse_f64(fields, "qi_fact")?,
        saa_sep: parse_f64(fields, "saa_sep")?,
        qual_frame: parse_f64(fields, "qual_frame")?,
        w1mpro: parse_opt_f64(fields, "w1mpro")?,
        w1sigmpro: parse_opt_f64(fields, "w1sigmpro")?,
        w1rchi2: parse_f64(fields, "w1rchi2")?,
        w1sat: parse_f64(fields, "w1sat")?,
        w1sky: parse_opt_f64(fields, "w1sky")?,
        w2mpro: parse_opt_f64(fields, "w2mpro")?,
        w2sigmpro: parse_opt_f64(fields, "w2sigmpro")?,
        w2rchi2: parse_f64(fields, "w2rchi2")?,
        w2sat: parse_f64(fields, "w2sat")?,
        w2sky: parse_opt_f64(fields, "w2sky")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client() -> ClientWithMiddleware {
        reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build()
    }

    fn ipac_body() -> String {
        "\\fixlen = T\n\
         |ra      |dec     |allwise_cntr|w1mpro|w1sigmpro|w1rchi2|w1sat|w1sky|w2mpro|w2sigmpro|w2rchi2|w2sat|w2sky|cc_flags|sso_flg|qi_fact|ph_qual|qual_frame|moon_masked|saa_sep|mjd|scan_id|\n\
         |double  |double  |long        |double|double   |double |double|double|double|double   |double |double|double|char    |int    |double |char   |double    |char       |double |double|char   |\n\
          10.0      20.0     123          15.0   0.02      1.0     0.0   0.5   15.5   0.03      1.1     0.0   0.5   00       0       1.0     AA      1.0        00          10.0    55500.0 scan1\n"
            .to_string()
    }

    #[tokio::test]
    async fn cone_search_parses_ipac_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/Gator/nph-query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ipac_body()))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_base_url(test_client(), server.uri());
        let rows = fetcher.fetch(&FetchMode::Cone { ra: 10.0, dec: 20.0 }).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].allwise_cntr, Some(123));
        assert_eq!(rows[0].w1mpro, Some(15.0));
    }

    #[tokio::test]
    async fn identifier_search_parses_csv_table() {
        let server = MockServer::start().await;
        let csv_body = "ra,dec,allwise_cntr,w1mpro,w1sigmpro,w1rchi2,w1sat,w1sky,w2mpro,w2sigmpro,\
            w2rchi2,w2sat,w2sky,cc_flags,sso_flg,qi_fact,ph_qual,qual_frame,moon_masked,saa_sep,mjd,scan_id\n\
            10.0,20.0,123,15.0,0.02,1.0,0.0,0.5,15.5,0.03,1.1,0.0,0.5,00,0,1.0,AA,1.0,00,10.0,55500.0,scan1\n";
        Mock::given(method("GET"))
            .and(path("/TAP/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_string(csv_body))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_base_url(test_client(), server.uri());
        let rows = fetcher
            .fetch(&FetchMode::Identifier { allwise_id: "J1234+5678".to_string() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scan_id, "scan1");
    }

    #[tokio::test]
    async fn empty_result_is_terminal_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/Gator/nph-query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "\\fixlen = T\n|ra|dec|\n|double|double|\n",
            ))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_base_url(test_client(), server.uri());
        let err = fetcher.fetch(&FetchMode::Cone { ra: 1.0, dec: 2.0 }).await.unwrap_err();
        assert!(matches!(err, Attempt::Terminal(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn server_error_is_classified_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/Gator/nph-query"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_base_url(test_client(), server.uri());
        let err = fetcher.fetch(&FetchMode::Cone { ra: 1.0, dec: 2.0 }).await.unwrap_err();
        assert!(matches!(err, Attempt::Retryable(Error::TransientRemote { status: 503, .. })));
    }

    #[tokio::test]
    async fn client_error_is_classified_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/Gator/nph-query"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_base_url(test_client(), server.uri());
        let err = fetcher.fetch(&FetchMode::Cone { ra: 1.0, dec: 2.0 }).await.unwrap_err();
        assert!(matches!(err, Attempt::Terminal(Error::PermanentRemote { status: 400, .. })));
    }
}
