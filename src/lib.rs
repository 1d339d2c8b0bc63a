pub mod arg_parser;
pub mod clients;
pub mod experiment;
pub mod recommender;
pub mod sweep;
