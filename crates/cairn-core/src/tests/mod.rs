mod clean;
mod count;
mod stats_fmt;
