use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// GPS Trail - When were you in an area, and which trips went from one area to another
pub struct Settings {
    /// Directory holding the encrypted index, its key and configuration
    #[clap(short, long, value_name = "DIR", default_value = "gps-trail-data")]
    pub data_dir: PathBuf,

    /// Log debug messages (overridden by RUST_LOG)
    #[clap(short, long, default_value = "false")]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Append fixes from a text file with one `time_sec lat lon` per line
    Ingest {
        #[clap(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print statistics about the index
    Info,

    /// Time ranges spent inside a rectangle
    #[clap(allow_negative_numbers = true)]
    Area {
        lat1: f64,
        lon1: f64,
        lat2: f64,
        lon2: f64,

        /// Only report time from this second on
        #[clap(long)]
        from: Option<i64>,

        /// Only report time before this second
        #[clap(long)]
        to: Option<i64>,
    },

    /// Trips passing through the given rectangles in order
    Path {
        /// Rectangles as `lat1,lon1,lat2,lon2`
        #[clap(required = true, num_args = 2.., allow_hyphen_values = true)]
        areas: Vec<LatLonRect>,

        #[clap(long)]
        from: Option<i64>,

        #[clap(long)]
        to: Option<i64>,
    },

    /// Where the trail was at a given second
    Where {
        time: i64,

        /// Panel depth to report (0 is the finest)
        #[clap(long, default_value = "0")]
        depth: u8,

        /// Look for the earliest fix after the time instead of the latest before it
        #[clap(long, default_value = "false")]
        after: bool,
    },
}

/// Two WGS84 corners of a rectangle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLonRect {
    pub lat1: f64,
    pub lon1: f64,
    pub lat2: f64,
    pub lon2: f64,
}

impl FromStr for LatLonRect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid coordinate in '{s}': {e}"))?;
        match values[..] {
            [lat1, lon1, lat2, lon2] => Ok(Self {
                lat1,
                lon1,
                lat2,
                lon2,
            }),
            _ => Err(format!(
                "expected lat1,lon1,lat2,lon2 but got {} values in '{s}'",
                values.len()
            )),
        }
    }
}

/// Time window from optional `--from`/`--to` bounds
pub fn window(from: Option<i64>, to: Option<i64>) -> Option<(i64, i64)> {
    if from.is_none() && to.is_none() {
        return None;
    }
    Some((from.unwrap_or(i64::MIN), to.unwrap_or(i64::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lat_lon_rect() {
        let rect: LatLonRect = "40.41, -3.71,40.42,-3.70".parse().unwrap();
        assert_eq!(rect.lat1, 40.41);
        assert_eq!(rect.lon1, -3.71);
        assert_eq!(rect.lon2, -3.70);

        assert!("1,2,3".parse::<LatLonRect>().is_err());
        assert!("1,2,3,north".parse::<LatLonRect>().is_err());
    }

    #[test]
    fn test_parse_subcommands() {
        let settings =
            Settings::try_parse_from(["gps-trail", "area", "40.4", "-3.72", "40.5", "-3.70", "--to", "99"]).unwrap();
        match settings.command {
            Command::Area { lon1, from, to, .. } => {
                assert_eq!(lon1, -3.72);
                assert_eq!(from, None);
                assert_eq!(to, Some(99));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let settings = Settings::try_parse_from([
            "gps-trail",
            "--data-dir",
            "/tmp/trail",
            "path",
            "40.41,-3.71,40.42,-3.70",
            "40.45,-3.68,40.46,-3.67",
        ])
        .unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/trail"));
        match settings.command {
            Command::Path { areas, .. } => assert_eq!(areas.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }

        // A path needs at least two areas
        assert!(Settings::try_parse_from(["gps-trail", "path", "1,2,3,4"]).is_err());
    }

    #[test]
    fn test_window() {
        assert_eq!(window(None, None), None);
        assert_eq!(window(Some(5), None), Some((5, i64::MAX)));
        assert_eq!(window(None, Some(7)), Some((i64::MIN, 7)));
    }
}
